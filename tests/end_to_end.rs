use dtn_tcpcl::{Event, LinkAddress, LinkConfig, LinkId, PeerConfig, PeerId, Stack, State};

mod common;
use common::*;

/// A stack listening on `port` with one peer reachable at `remote_port`.
fn node(eid: &str, port: u16, remote_port: u16) -> (Stack, LinkId, PeerId) {
    let stack = Stack::new(stack_config(eid));
    let link = stack
        .add_link(LinkConfig::tcpcl("lo", localhost(), port))
        .unwrap();
    let peer = stack
        .add_peer(PeerConfig {
            addresses: vec![LinkAddress::new(link, localhost()).with_port(remote_port)],
            ..PeerConfig::new("other")
        })
        .unwrap();

    (stack, link, peer)
}

#[test]
fn blocks_flow_both_ways() {
    init_logger();

    let (a, a_link, a_peer) = node("dtn://a", 7421, 7422);
    let (b, b_link, b_peer) = node("dtn://b", 7422, 7421);

    let (a_listener, a_events) = dtn_tcpcl::channel_listener();
    let (b_listener, b_events) = dtn_tcpcl::channel_listener();
    a.register_listener(a_listener);
    b.register_listener(b_listener);

    // queued while stopped, sent once started
    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    a.send_block(big.clone(), big.len(), a_link, a_peer, 1)
        .unwrap();

    b.start().unwrap();
    a.start().unwrap();

    match next_event(&a_events) {
        Event::Transmitted(block) => assert_eq!(block.client_id, 1),
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&b_events) {
        Event::Received(block) => {
            assert_eq!(block.bytes, big);
            assert_eq!(block.peer, b_peer);
        }
        other => panic!("unexpected event {other:?}"),
    }

    b.send_block(b"reply".to_vec(), 5, b_link, b_peer, 2).unwrap();

    match next_event(&b_events) {
        Event::Transmitted(block) => assert_eq!(block.client_id, 2),
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&a_events) {
        Event::Received(block) => {
            assert_eq!(block.bytes, b"reply");
            assert_eq!(block.peer, a_peer);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let a_status = a.peer_status(a_peer).unwrap();
    assert_eq!(a_status.initiator.state, State::WaitBlockToSend);
    assert_eq!(
        a_status.acceptor.map(|status| status.state),
        Some(State::WaitBlockToSend)
    );

    let negotiated = a_status.initiator.negotiated.unwrap();
    assert!(negotiated.ack_data_segments);
    assert_eq!(negotiated.keepalive_secs, 10);
    assert_eq!(negotiated.idle_timeout_secs, 20);

    // 10000 bytes over 4500-byte segments
    assert_eq!(a.statistics().data_segments_sent, 3);
    assert_eq!(b.statistics().acks_sent, 3);

    a.stop();
    b.stop();
    assert_eq!(a.peer_status(a_peer).unwrap().initiator.state, State::Stopped);
}
