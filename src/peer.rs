use crate::config::PeerConfig;

/// Unique peer identifier. Ids are never reused within one stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub(crate) u64);

impl PeerId {
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// A registered peer as seen from outside the stack.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub config: PeerConfig,
    /// Created for an inbound connection from an unconfigured address; removed when stopped.
    pub temporary: bool,
}
