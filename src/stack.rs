use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use intmap::IntMap;

use crate::api::Listener;
use crate::block::Block;
use crate::config::{LinkConfig, PeerConfig, StackConfig};
use crate::connector::{Connector, DefaultConnector};
use crate::context::Context;
use crate::error::{BlockError, ConfigError, Error, Result};
use crate::link::{Link, LinkAddress, LinkId};
use crate::listener::LinkListener;
use crate::machine::{MachineHandle, Status};
use crate::peer::{PeerId, PeerInfo};
use crate::stats::StatisticsSnapshot;

/// Status of both state machines of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub initiator: Status,
    /// Present while an accepted connection is (or was last) served.
    pub acceptor: Option<Status>,
}

struct Peer {
    id: PeerId,
    config: PeerConfig,
    temporary: bool,
    initiator: Arc<MachineHandle>,
    acceptor: Option<Arc<MachineHandle>>,
    /// Links on which this peer holds a listener reference.
    listening: Vec<LinkId>,
}

struct ListenerEntry {
    link: LinkId,
    listener: LinkListener,
    refs: usize,
}

struct Inner {
    context: Arc<Context>,
    peers: Mutex<IntMap<Peer>>,
    listeners: Mutex<IntMap<ListenerEntry>>,
    next_peer: AtomicU64,
    started: AtomicBool,
}

/// A TCPCL stack: link and peer registries, one initiator state machine per peer, acceptor
/// machines for inbound connections and a listener per link that peers accept connections on.
///
/// Listener callbacks run on state machine threads. Calling back into the stack from them is
/// allowed, but a callback that blocks delays every other event of that peer.
pub struct Stack {
    inner: Arc<Inner>,
}

impl Stack {
    /// Creates a stack with the default connector.
    pub fn new(config: StackConfig) -> Self {
        Self::with_connector(config, DefaultConnector)
    }

    /// Creates a stack with a custom connector.
    pub fn with_connector(config: StackConfig, connector: impl Connector) -> Self {
        let context = Arc::new(Context::new(config, Box::new(connector)));

        Self {
            inner: Arc::new(Inner {
                context,
                peers: Mutex::new(IntMap::new()),
                listeners: Mutex::new(IntMap::new()),
                next_peer: AtomicU64::new(0),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.inner.context.config
    }

    /// Registers a link. Links start out operational.
    pub fn add_link(&self, config: LinkConfig) -> Result<LinkId> {
        config.validate()?;

        let mut links = self.inner.context.links_mut();
        if links.iter().any(|(_, link)| link.config.name == config.name) {
            return Err(ConfigError::Duplicate("link", config.name).into());
        }

        log::info!("link {}: added", config.name);

        Ok(LinkId(links.insert(Link {
            config,
            operational: true,
        })))
    }

    /// Removes a link that no peer refers to.
    pub fn remove_link(&self, id: LinkId) -> Result<()> {
        let name = self.link(id).map(|link| link.config.name).ok_or_else(|| {
            Error::from(ConfigError::Unknown("link", id.to_string()))
        })?;

        let in_use = self
            .inner
            .peers()
            .values()
            .any(|peer| peer.config.addresses.iter().any(|a| a.link == id));
        if in_use {
            return Err(ConfigError::LinkInUse(name).into());
        }

        let entry = self.inner.listeners().remove(id.0 as u64);
        if let Some(entry) = entry {
            entry
                .listener
                .stop(self.inner.context.config.timeouts.join);
        }

        self.inner.context.links_mut().try_remove(id.0);
        log::info!("link {name}: removed");

        Ok(())
    }

    pub fn find_link(&self, name: &str) -> Option<LinkId> {
        self.inner
            .context
            .links()
            .iter()
            .find(|(_, link)| link.config.name == name)
            .map(|(key, _)| LinkId(key))
    }

    pub fn link(&self, id: LinkId) -> Option<Link> {
        self.inner.context.links().get(id.0).cloned()
    }

    /// Marks a link up or down. Peers connect and blocks are sent only over operational links.
    pub fn set_link_operational(&self, id: LinkId, operational: bool) -> Result<()> {
        let mut links = self.inner.context.links_mut();
        let link = links
            .get_mut(id.0)
            .ok_or_else(|| ConfigError::Unknown("link", id.to_string()))?;

        log::info!("link {}: operational = {operational}", link.config.name);
        link.operational = operational;

        Ok(())
    }

    /// Registers a peer. Its initiator starts right away if the stack is started.
    pub fn add_peer(&self, config: PeerConfig) -> Result<PeerId> {
        config.validate()?;

        {
            let links = self.inner.context.links();
            if let Some(address) = config.addresses.iter().find(|a| !links.contains(a.link.0)) {
                return Err(ConfigError::Unknown("link", address.link.to_string()).into());
            }
        }

        if self.find_peer(&config.name).is_some() {
            return Err(ConfigError::Duplicate("peer", config.name).into());
        }

        let id = self.inner.insert_peer(config, false)?;

        if self.inner.started.load(Ordering::SeqCst) {
            self.start_peer(id)?;
        }

        Ok(id)
    }

    /// Stops a peer and forgets it.
    pub fn remove_peer(&self, id: PeerId) -> Result<()> {
        self.stop_peer(id)?;

        let peer = self.inner.peers().remove(id.0).ok_or_else(|| unknown_peer(id))?;
        log::info!("peer {}: removed", peer.config.name);
        self.inner.shutdown_peer(peer);

        Ok(())
    }

    pub fn find_peer(&self, name: &str) -> Option<PeerId> {
        self.inner
            .peers()
            .values()
            .find(|peer| peer.config.name == name)
            .map(|peer| peer.id)
    }

    /// Finds the peer that has `address` among its addresses.
    pub fn find_peer_by_address(&self, address: IpAddr) -> Option<PeerId> {
        self.inner.find_peer_by_address(address)
    }

    pub fn peer(&self, id: PeerId) -> Option<PeerInfo> {
        self.inner.peers().get(id.0).map(Peer::info)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.inner.peers().values().map(Peer::info).collect();

        peers.sort_by_key(|peer| peer.id);
        peers
    }

    /// Starts every configured peer.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            log::debug!("stack already started");
            return Ok(());
        }

        log::info!("starting stack");

        let ids: Vec<PeerId> = self
            .inner
            .peers()
            .values()
            .filter(|peer| !peer.temporary)
            .map(|peer| peer.id)
            .collect();

        for id in ids {
            self.start_peer(id)?;
        }

        Ok(())
    }

    /// Stops every peer and removes temporary ones. Safe to call repeatedly.
    pub fn stop(&self) {
        let was_started = self.inner.started.swap(false, Ordering::SeqCst);
        log::info!("stopping stack");

        let ids: Vec<PeerId> = self.inner.peers().values().map(|peer| peer.id).collect();
        for id in ids {
            if let Err(err) = self.stop_peer(id) {
                log::warn!("peer {id}: stop failed: {err}");
            }
        }

        let temporary: Vec<Peer> = {
            let mut peers = self.inner.peers();
            let ids: Vec<u64> = peers
                .values()
                .filter(|peer| peer.temporary)
                .map(|peer| peer.id.0)
                .collect();
            ids.into_iter().filter_map(|id| peers.remove(id)).collect()
        };

        for peer in temporary {
            log::debug!("peer {}: temporary peer removed", peer.config.name);
            self.inner.shutdown_peer(peer);
        }

        if !was_started {
            log::debug!("stack was not started");
        }
    }

    /// Starts a peer's initiator and, if it accepts connections, the listeners of its links.
    pub fn start_peer(&self, id: PeerId) -> Result<()> {
        let (initiator, links) = {
            let mut peers = self.inner.peers();
            let peer = peers.get_mut(id.0).ok_or_else(|| unknown_peer(id))?;

            let mut links = Vec::new();
            if peer.config.accept_connections && peer.listening.is_empty() {
                for address in &peer.config.addresses {
                    if !links.contains(&address.link) {
                        links.push(address.link);
                    }
                }
                peer.listening = links.clone();
            }

            (peer.initiator.clone(), links)
        };

        for link in links {
            self.inner.acquire_listener(link)?;
        }

        initiator.start()
    }

    /// Stops a peer's state machines and releases its listeners.
    pub fn stop_peer(&self, id: PeerId) -> Result<()> {
        let (initiator, acceptor, links) = {
            let mut peers = self.inner.peers();
            let peer = peers.get_mut(id.0).ok_or_else(|| unknown_peer(id))?;
            (
                peer.initiator.clone(),
                peer.acceptor.clone(),
                std::mem::take(&mut peer.listening),
            )
        };

        for link in links {
            self.inner.release_listener(link);
        }

        if let Some(acceptor) = acceptor {
            acceptor.shutdown();
        }

        initiator.stop()
    }

    /// Queues `length` bytes of `bytes` for transmission to `peer` over `link`. Completion or
    /// failure is reported to the registered listeners along with `client_id`.
    pub fn send_block(
        &self,
        mut bytes: Vec<u8>,
        length: usize,
        link: LinkId,
        peer: PeerId,
        client_id: u64,
    ) -> Result<()> {
        if length > bytes.len() {
            return Err(ConfigError::BlockLength {
                length,
                available: bytes.len(),
            }
            .into());
        }
        bytes.truncate(length);

        let initiator = self
            .inner
            .peers()
            .get(peer.0)
            .map(|p| p.initiator.clone())
            .ok_or_else(|| unknown_peer(peer))?;

        let block = Block {
            bytes,
            peer,
            link,
            client_id,
        };

        initiator.enqueue(block).map_err(|block| {
            self.inner
                .context
                .block_failed(&block, BlockError::Stopped);
            Error::Terminated
        })
    }

    pub fn register_listener(&self, listener: Arc<dyn Listener>) {
        self.inner.context.notifier.register(listener);
    }

    /// Removes a listener registered earlier. Returns whether it was registered.
    pub fn unregister_listener(&self, listener: &Arc<dyn Listener>) -> bool {
        self.inner.context.notifier.unregister(listener)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.context.stats.snapshot()
    }

    pub fn clear_statistics(&self) {
        self.inner.context.stats.clear();
    }

    pub fn peer_status(&self, id: PeerId) -> Option<PeerStatus> {
        let (initiator, acceptor) = {
            let peers = self.inner.peers();
            let peer = peers.get(id.0)?;
            (peer.initiator.clone(), peer.acceptor.clone())
        };

        Some(PeerStatus {
            initiator: initiator.status(),
            acceptor: acceptor.map(|a| a.status()),
        })
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.stop();

        let peers: Vec<Peer> = {
            let mut peers = self.inner.peers();
            let ids: Vec<u64> = peers.values().map(|peer| peer.id.0).collect();
            ids.into_iter().filter_map(|id| peers.remove(id)).collect()
        };

        for peer in peers {
            self.inner.shutdown_peer(peer);
        }

        let listeners: Vec<ListenerEntry> = {
            let mut listeners = self.inner.listeners();
            let ids: Vec<u64> = listeners.values().map(|entry| entry.link.0 as u64).collect();
            ids.into_iter().filter_map(|id| listeners.remove(id)).collect()
        };

        for entry in listeners {
            entry.listener.stop(self.inner.context.config.timeouts.join);
        }
    }
}

impl Peer {
    fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            config: self.config.clone(),
            temporary: self.temporary,
        }
    }
}

fn unknown_peer(id: PeerId) -> Error {
    ConfigError::Unknown("peer", id.to_string()).into()
}

impl Inner {
    fn peers(&self) -> MutexGuard<'_, IntMap<Peer>> {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, IntMap<ListenerEntry>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert_peer(&self, config: PeerConfig, temporary: bool) -> Result<PeerId> {
        let id = PeerId(self.next_peer.fetch_add(1, Ordering::SeqCst));
        let initiator = MachineHandle::spawn_initiator(self.context.clone(), id, config.clone())?;

        log::info!("peer {}: added as {id}", config.name);

        self.peers().insert(
            id.0,
            Peer {
                id,
                config,
                temporary,
                initiator: Arc::new(initiator),
                acceptor: None,
                listening: Vec::new(),
            },
        );

        Ok(id)
    }

    fn find_peer_by_address(&self, address: IpAddr) -> Option<PeerId> {
        self.peers()
            .values()
            .find(|peer| peer.config.addresses.iter().any(|a| a.address == address))
            .map(|peer| peer.id)
    }

    fn shutdown_peer(&self, peer: Peer) {
        for link in peer.listening {
            self.release_listener(link);
        }
        if let Some(acceptor) = peer.acceptor {
            acceptor.shutdown();
        }
        peer.initiator.shutdown();
    }

    fn acquire_listener(self: &Arc<Self>, link: LinkId) -> Result<()> {
        let mut listeners = self.listeners();

        if let Some(entry) = listeners.get_mut(link.0 as u64) {
            entry.refs += 1;
            return Ok(());
        }

        let Some(addr) = self.context.links().get(link.0).and_then(Link::listen_addr) else {
            return Ok(());
        };

        let weak: Weak<Inner> = Arc::downgrade(self);
        let listener = LinkListener::spawn(
            &link.to_string(),
            addr,
            self.context.config.timeouts.listener_retry,
            Arc::new(move |stream, remote| {
                if let Some(inner) = weak.upgrade() {
                    inner.accept(link, stream, remote);
                }
            }),
        )?;

        listeners.insert(
            link.0 as u64,
            ListenerEntry {
                link,
                listener,
                refs: 1,
            },
        );

        Ok(())
    }

    fn release_listener(&self, link: LinkId) {
        let entry = {
            let mut listeners = self.listeners();
            match listeners.get_mut(link.0 as u64) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    None
                }
                Some(_) => listeners.remove(link.0 as u64),
                None => None,
            }
        };

        if let Some(entry) = entry {
            entry.listener.stop(self.context.config.timeouts.join);
        }
    }

    /// Hands an accepted connection to the acceptor of the peer it comes from, replacing the
    /// previous acceptor of that peer.
    fn accept(&self, link: LinkId, stream: TcpStream, remote: SocketAddr) {
        let id = match self.find_peer_by_address(remote.ip()) {
            Some(id) => id,
            None if self.context.config.accept_unconfigured_neighbors => {
                let config = PeerConfig {
                    name: remote.ip().to_string(),
                    accept_connections: false,
                    addresses: vec![LinkAddress::new(link, remote.ip())],
                    ..Default::default()
                };

                match self.insert_peer(config, true) {
                    Ok(id) => id,
                    Err(err) => {
                        log::error!("cannot create peer for {remote}: {err}");
                        return;
                    }
                }
            }
            None => {
                log::info!("rejecting connection from unconfigured address {remote}");
                return;
            }
        };

        let (previous, config) = {
            let mut peers = self.peers();
            let Some(peer) = peers.get_mut(id.0) else {
                return;
            };
            (peer.acceptor.take(), peer.config.clone())
        };

        if let Some(previous) = previous {
            log::debug!("peer {}: replacing acceptor", config.name);
            previous.shutdown();
        }

        let acceptor =
            match MachineHandle::spawn_acceptor(self.context.clone(), id, config, stream, link) {
                Ok(acceptor) => Arc::new(acceptor),
                Err(err) => {
                    log::error!("peer {id}: cannot start acceptor: {err}");
                    return;
                }
            };

        let displaced = {
            let mut peers = self.peers();
            match peers.get_mut(id.0) {
                Some(peer) => peer.acceptor.replace(acceptor),
                None => Some(acceptor),
            }
        };

        if let Some(displaced) = displaced {
            displaced.shutdown();
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn link_registry() {
        let stack = Stack::new(StackConfig::default());
        let link = stack
            .add_link(LinkConfig::tcpcl("eth0", localhost(), 4556))
            .unwrap();

        assert_eq!(stack.find_link("eth0"), Some(link));
        assert!(matches!(
            stack.add_link(LinkConfig::tcpcl("eth0", localhost(), 4557)),
            Err(Error::Config(ConfigError::Duplicate("link", _)))
        ));

        stack.set_link_operational(link, false).unwrap();
        assert!(!stack.link(link).unwrap().operational);

        let peer = stack
            .add_peer(PeerConfig {
                addresses: vec![LinkAddress::new(link, localhost())],
                ..PeerConfig::new("p")
            })
            .unwrap();

        assert!(matches!(
            stack.remove_link(link),
            Err(Error::Config(ConfigError::LinkInUse(_)))
        ));

        stack.remove_peer(peer).unwrap();
        stack.remove_link(link).unwrap();
        assert_eq!(stack.find_link("eth0"), None);
    }

    #[test]
    fn peer_registry() {
        let stack = Stack::new(StackConfig::default());
        let link = stack
            .add_link(LinkConfig::tcpcl("eth0", localhost(), 4556))
            .unwrap();

        let config = PeerConfig {
            addresses: vec![LinkAddress::new(link, "10.0.0.7".parse().unwrap())],
            ..PeerConfig::new("seven")
        };
        let id = stack.add_peer(config.clone()).unwrap();

        assert_eq!(stack.find_peer("seven"), Some(id));
        assert_eq!(
            stack.find_peer_by_address("10.0.0.7".parse().unwrap()),
            Some(id)
        );
        assert_eq!(stack.find_peer_by_address(localhost()), None);
        assert!(matches!(
            stack.add_peer(config),
            Err(Error::Config(ConfigError::Duplicate("peer", _)))
        ));

        let status = stack.peer_status(id).unwrap();
        assert_eq!(status.initiator.state, crate::machine::State::Stopped);
        assert_eq!(status.acceptor, None);

        let info = stack.peer(id).unwrap();
        assert!(!info.temporary);
        assert_eq!(stack.peers().len(), 1);

        stack.remove_peer(id).unwrap();
        assert_eq!(stack.find_peer("seven"), None);
        assert!(stack.remove_peer(id).is_err());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let stack = Stack::new(StackConfig::default());

        assert!(matches!(
            stack.add_peer(PeerConfig {
                keep_alive_interval_secs: 30,
                idle_connection_shutdown_delay_secs: 20,
                ..PeerConfig::new("p")
            }),
            Err(Error::Config(ConfigError::IdleDelayTooShort { .. }))
        ));

        assert!(matches!(
            stack.add_peer(PeerConfig {
                addresses: vec![LinkAddress::new(LinkId(3), localhost())],
                ..PeerConfig::new("p")
            }),
            Err(Error::Config(ConfigError::Unknown("link", _)))
        ));

        assert!(matches!(
            stack.send_block(vec![1, 2], 3, LinkId(0), PeerId(0), 0),
            Err(Error::Config(ConfigError::BlockLength { .. }))
        ));
        assert!(stack
            .send_block(vec![1, 2], 2, LinkId(0), PeerId(0), 0)
            .is_err());
    }
}
