use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::event::Event;
use crate::connector::Backoff;
use crate::context::Context;
use crate::link::LinkAddress;
use crate::stats;
use crate::task;

/// Connect task body: resolves the peer's address and connects, backing off exponentially
/// between failures, until a connection is made or the task is cancelled.
pub(crate) fn connect(
    context: Arc<Context>,
    addresses: Vec<LinkAddress>,
    attempt: u64,
    events: Sender<Event>,
    cancel: Receiver<()>,
    name: String,
) {
    let timeouts = context.config.timeouts;
    let mut backoff = Backoff::new(timeouts.connect_backoff_min, timeouts.connect_backoff_max);

    loop {
        let Some((addr, link)) = context.resolve(&addresses) else {
            log::debug!(
                "{name}: no operational address, retrying in {:?}",
                timeouts.address_retry
            );
            backoff.reset();
            if task::sleep_or_cancel(&cancel, timeouts.address_retry) {
                return;
            }
            continue;
        };

        log::debug!("{name}: connecting to {addr}");

        match context.connector.connect(addr, timeouts.connect) {
            Ok(stream) => {
                if task::is_cancelled(&cancel) {
                    log::debug!("{name}: connect to {addr} cancelled");
                    return;
                }

                stats::bump(&context.stats.connects);

                let event = Event::Connected {
                    attempt,
                    stream,
                    addr,
                    link,
                };

                crossbeam_channel::select! {
                    send(events, event) -> _ => {},
                    recv(cancel) -> _ => {},
                }
                return;
            }
            Err(err) => {
                let delay = backoff.next_delay();
                log::debug!("{name}: connect to {addr} failed: {err}, retrying in {delay:?}");

                if task::sleep_or_cancel(&cancel, delay) {
                    return;
                }
            }
        }
    }
}
