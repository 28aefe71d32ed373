//! A delay-tolerant networking TCP convergence layer (TCPCL). It moves opaque blocks between
//! peers over TCP connections that may drop and come back at any time. Connection setup,
//! capability negotiation, segmentation, acknowledgements, keepalives and reconnection are
//! handled by the library.
//!
//! The way to use this crate is to create a [`Stack`], register links and peers with it,
//! register a [`Listener`] for block notifications and start it. Every peer gets its own state
//! machine running on its own thread; the stack only routes requests to them.
//!
//! The following example sends a block to a peer listening on localhost and waits for the
//! outcome.
//!
//! ```no_run
//! # use std::net::{IpAddr, Ipv4Addr};
//! # fn main() -> Result<(), dtn_tcpcl::Error> {
//! use dtn_tcpcl::{Event, LinkAddress, LinkConfig, PeerConfig, Stack, StackConfig};
//!
//! let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
//! let stack = Stack::new(StackConfig::default());
//!
//! // one link, and a peer reachable over it
//! let link = stack.add_link(LinkConfig::tcpcl("lo", localhost, 4556))?;
//! let peer = stack.add_peer(PeerConfig {
//!     addresses: vec![LinkAddress::new(link, localhost).with_port(4557)],
//!     ..PeerConfig::new("neighbor")
//! })?;
//!
//! let (listener, events) = dtn_tcpcl::channel_listener();
//! stack.register_listener(listener);
//! stack.start()?;
//!
//! stack.send_block(b"hello".to_vec(), 5, link, peer, 1)?;
//!
//! match events.receive_blocking()? {
//!     Event::Transmitted(block) => println!("block {} delivered", block.client_id),
//!     Event::Failed(block, err) => println!("block {} failed: {err}", block.client_id),
//!     Event::Received(block) => println!("received {} bytes", block.len()),
//! }
//!
//! stack.stop();
//! # Ok(())
//! # }
//! ```

mod api;
mod block;
pub mod buffer;
mod config;
mod connector;
mod context;
mod error;
mod link;
mod listener;
mod machine;
mod peer;
pub mod sdnv;
pub mod segment;
mod stack;
mod stats;
mod task;

pub use api::{channel_listener, ChannelListener, Event, Events, Listener};
pub use block::{fragment, Block, Fragmenter, Progress, Reassembler};
pub use config::{LinkConfig, PeerConfig, StackConfig, Timeouts};
pub use connector::{Connector, DefaultConnector};
pub use error::{BlockError, ConfigError, DecodeError, Error, ProtocolError, Result};
pub use link::{Link, LinkAddress, LinkId, LinkKind};
pub use machine::{NegotiatedParameters, Role, State, Status};
pub use peer::{PeerId, PeerInfo};
pub use stack::{PeerStatus, Stack};
pub use stats::StatisticsSnapshot;
