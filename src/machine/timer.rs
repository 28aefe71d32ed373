use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Idle,
    KeepAlive,
    Ack,
    Reconnect,
}

const KINDS: [TimerKind; 4] = [
    TimerKind::Idle,
    TimerKind::KeepAlive,
    TimerKind::Ack,
    TimerKind::Reconnect,
];

/// One-shot deadlines owned by a state machine. Starting a timer replaces any earlier deadline
/// of the same kind, so a timer is never scheduled twice.
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: [Option<Instant>; 4],
}

impl Timers {
    pub fn start(&mut self, kind: TimerKind, after: Duration) {
        self.deadlines[kind as usize] = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind as usize] = None;
    }

    pub fn cancel_all(&mut self) {
        self.deadlines = [None; 4];
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Disarms and returns the earliest timer that expired at `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerKind> {
        let kind = KINDS
            .into_iter()
            .filter_map(|kind| Some((kind, self.deadlines[kind as usize]?)))
            .filter(|(_, deadline)| *deadline <= now)
            .min_by_key(|(_, deadline)| *deadline)
            .map(|(kind, _)| kind)?;

        self.cancel(kind);
        Some(kind)
    }
}
