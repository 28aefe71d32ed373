use std::net::{IpAddr, SocketAddr};

use crate::config::LinkConfig;

/// Identifier of a registered link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub(crate) usize);

impl LinkId {
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// Convergence layer specific link parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Tcpcl {
        max_segment_size: usize,
        tcp_port: u16,
    },
    /// Carried in the registry for completeness; the TCP convergence layer never uses it.
    Udp { port: u16, max_datagram_size: usize },
}

impl LinkKind {
    pub fn tcpcl() -> Self {
        LinkKind::Tcpcl {
            max_segment_size: 4500,
            tcp_port: 4556,
        }
    }
}

/// An address at which a peer can be reached over a given link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAddress {
    pub link: LinkId,
    pub address: IpAddr,
    /// Overrides the link's port when connecting to this address.
    pub port: Option<u16>,
}

impl LinkAddress {
    pub fn new(link: LinkId, address: IpAddr) -> Self {
        Self {
            link,
            address,
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// A registered link.
#[derive(Debug, Clone)]
pub struct Link {
    pub config: LinkConfig,
    pub operational: bool,
}

impl Link {
    /// The TCP parameters of an operational TCPCL link.
    pub fn tcpcl(&self) -> Option<(usize, u16)> {
        match self.config.kind {
            LinkKind::Tcpcl {
                max_segment_size,
                tcp_port,
            } if self.operational => Some((max_segment_size, tcp_port)),
            _ => None,
        }
    }

    /// Local socket address a TCPCL listener binds to.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match self.config.kind {
            LinkKind::Tcpcl { tcp_port, .. } => Some(SocketAddr::new(self.config.address, tcp_port)),
            LinkKind::Udp { .. } => None,
        }
    }
}
