use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live protocol counters shared by every state machine of a stack.
        #[derive(Debug, Default)]
        pub struct Statistics {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`Statistics`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct StatisticsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl Statistics {
            pub fn snapshot(&self) -> StatisticsSnapshot {
                StatisticsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            pub fn clear(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    /// Blocks fully transmitted (and acknowledged, when acks are in use).
    blocks_sent,
    /// Blocks reported to the upper layer as failed.
    block_send_errors,
    blocks_received,
    segments_sent,
    segments_received,
    data_segments_sent,
    data_segments_received,
    acks_sent,
    acks_received,
    nacks_sent,
    nacks_received,
    contact_headers_sent,
    contact_headers_received,
    keepalives_sent,
    keepalives_received,
    shutdowns_sent,
    shutdowns_received,
    keepalive_timer_expirations,
    idle_timer_expirations,
    reconnect_timer_expirations,
    ack_timer_expirations,
    /// Outbound connections established.
    connects,
    /// Inbound connections handed to an acceptor.
    accepts,
    disconnects,
}

/// Increments a counter.
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
