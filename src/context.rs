use std::net::SocketAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use slab::Slab;

use crate::api::Notifier;
use crate::block::Block;
use crate::config::StackConfig;
use crate::connector::Connector;
use crate::error::BlockError;
use crate::link::{Link, LinkAddress, LinkId};
use crate::stats::{self, Statistics};

/// State shared by every state machine and listener of one stack.
pub(crate) struct Context {
    pub config: StackConfig,
    pub links: RwLock<Slab<Link>>,
    pub notifier: Notifier,
    pub stats: Statistics,
    pub connector: Box<dyn Connector>,
}

impl Context {
    pub fn new(config: StackConfig, connector: Box<dyn Connector>) -> Self {
        Self {
            config,
            links: RwLock::new(Slab::with_capacity(4)),
            notifier: Notifier::default(),
            stats: Statistics::default(),
            connector,
        }
    }

    pub fn links(&self) -> RwLockReadGuard<'_, Slab<Link>> {
        self.links
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn links_mut(&self) -> RwLockWriteGuard<'_, Slab<Link>> {
        self.links
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The first address on an operational TCPCL link, as a socket address to connect to.
    pub fn resolve(&self, addresses: &[LinkAddress]) -> Option<(SocketAddr, LinkId)> {
        let links = self.links();

        addresses.iter().find_map(|address| {
            let (_, tcp_port) = links.get(address.link.0)?.tcpcl()?;
            let port = address.port.unwrap_or(tcp_port);
            Some((SocketAddr::new(address.address, port), address.link))
        })
    }

    /// Maximum segment size of a link, if it is an operational TCPCL link.
    pub fn max_segment_size(&self, link: LinkId) -> Option<usize> {
        self.links()
            .get(link.0)
            .and_then(Link::tcpcl)
            .map(|(max_segment_size, _)| max_segment_size)
    }

    pub fn block_failed(&self, block: &Block, error: BlockError) {
        stats::bump(&self.stats.block_send_errors);
        self.notifier.failed(block, &error);
    }
}
