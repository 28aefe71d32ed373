use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Types implementing this trait open outbound connections for the initiator. This can be used
/// for proxying, binding to a specific interface and similar custom scenarios.
///
/// The call blocks the connect task only; the state machine stays responsive while it runs.
/// The returned stream must be in blocking mode.
pub trait Connector: Send + Sync + 'static {
    /// Connect to `addr`, giving up after `timeout`.
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream>;
}

/// Default [`Connector`] that connects straight to the target address.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

impl Connector for DefaultConnector {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        TcpStream::connect_timeout(&addr, timeout)
    }
}

/// Exponential connect backoff: starts at `min`, doubles after every failure, capped at `max`.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
