// Multi-node sessions over real localhost TCP.
//
// Each test starts full nodes (listener, dialers, node loop) through
// `TestNode` and waits on their published views. Timers are shortened so
// redials and ticks happen every few tens of milliseconds.

use std::time::Duration;

use multiplayer_tests::{SceneCall, TestNode, init_tracing};
use xoxo_protocol::{Pose, SessionId, TileColor, TileIndex};
use xoxo_session::NodeView;
use xoxo_session::coordinator::STATUS_CONNECTED;

fn centre() -> TileIndex {
    TileIndex::new(4).unwrap()
}

#[test]
fn two_nodes_learn_each_others_session_ids() {
    init_tracing();
    let host = TestNode::start(&[], |_| {});
    let guest = TestNode::start(&[host.addr()], |_| {});

    host.wait_connected(&[guest.peer()]);
    guest.wait_connected(&[host.peer()]);

    let guest_session = guest.view().session_id;
    let host_session = host.view().session_id;
    host.wait_for("guest session id", |v| v.session_of(guest.peer()) == Some(guest_session));
    guest.wait_for("host session id", |v| v.session_of(host.peer()) == Some(host_session));

    guest.stop();
    host.stop();
}

#[test]
fn session_id_changes_reach_connected_peers() {
    init_tracing();
    let host = TestNode::start(&[], |_| {});
    let guest = TestNode::start(&[host.addr()], |_| {});
    let host_session = host.view().session_id;
    guest.wait_for("host session id", |v| v.session_of(host.peer()) == Some(host_session));

    let fresh = SessionId::random();
    host.handle.set_session_id(fresh);
    guest.wait_for("new host session id", |v| v.session_of(host.peer()) == Some(fresh));

    let old = guest.view().session_id;
    guest.handle.regenerate_session_id();
    let regenerated = guest.wait_for("regenerated id", |v| v.session_id != old).session_id;
    host.wait_for("regenerated guest id", |v| v.session_of(guest.peer()) == Some(regenerated));

    // The registry resolves the anchor back to the guest.
    host.handle.participant_anchor_added(regenerated);
    host.wait_for("anchor status", |v| v.status == STATUS_CONNECTED);
    assert!(
        host.log
            .calls()
            .contains(&SceneCall::ParticipantAnchor(regenerated, Some(guest.peer())))
    );

    guest.stop();
    host.stop();
}

#[test]
fn max_peers_caps_the_connected_set() {
    init_tracing();
    let host = TestNode::start(&[], |c| c.max_peers = 1);
    let first = TestNode::start(&[host.addr()], |_| {});
    let second = TestNode::start(&[host.addr()], |_| {});

    host.wait_for("one peer", |v| v.connected.len() == 1);
    host.hold_for("at most one peer", Duration::from_millis(300), |v| {
        v.connected.len() <= 1
    });

    let admitted = host.view().connected[0];
    assert!(admitted == first.peer() || admitted == second.peer());
    let refused = if admitted == first.peer() { &second } else { &first };
    assert!(refused.view().connected.is_empty());

    second.stop();
    first.stop();
    host.stop();
}

#[test]
fn three_nodes_share_one_board_and_agree_on_contested_tile() {
    init_tracing();
    let a = TestNode::start(&[], |_| {});
    let b = TestNode::start(&[a.addr()], |_| {});
    let c = TestNode::start(&[a.addr(), b.addr()], |_| {});

    a.wait_connected(&[b.peer(), c.peer()]);
    b.wait_connected(&[a.peer(), c.peer()]);
    c.wait_connected(&[a.peer(), b.peer()]);

    let board = a.handle.place_board(Pose::at(0.0, -1.2, -0.6)).unwrap();
    for node in [&b, &c] {
        node.wait_for("board", |v| v.boards.iter().any(|s| s.board == board));
    }

    // Both non-custodians go for the same tile at once.
    b.handle.interact(board, centre(), TileColor::Blue).unwrap();
    c.handle.interact(board, centre(), TileColor::Red).unwrap();

    let settled = |v: &NodeView| {
        v.pending_requests == 0
            && v.tile(board, centre()).is_some_and(|t| t.owner.is_some() && t.color.is_some())
    };
    for node in [&a, &b, &c] {
        node.wait_for("contested tile to settle", settled);
    }

    // Whoever owns the tile painted it with its own color, and every node
    // eventually shows the same state.
    let expected = b.wait_for("b to see a consistent tile", |v| {
        v.tile(board, centre()).is_some_and(|t| {
            (t.owner == Some(b.peer()) && t.color == Some(TileColor::Blue))
                || (t.owner == Some(c.peer()) && t.color == Some(TileColor::Red))
        })
    });
    let expected = expected.tile(board, centre()).unwrap();
    for node in [&a, &c] {
        node.wait_for("same tile everywhere", |v| {
            v.tile(board, centre())
                .is_some_and(|t| t.owner == expected.owner && t.color == expected.color)
        });
    }
    assert!(c.log.calls().contains(&SceneCall::BoardAdded(board, Pose::at(0.0, -1.2, -0.6))));

    // The custodian leaves; the others pick the same successor and can still
    // claim tiles.
    a.stop();
    b.wait_connected(&[c.peer()]);
    c.wait_connected(&[b.peer()]);
    let corner = TileIndex::new(0).unwrap();
    c.handle.interact(board, corner, TileColor::Red).unwrap();
    for node in [&b, &c] {
        node.wait_for("corner painted", |v| {
            v.tile(board, corner)
                .is_some_and(|t| t.owner == Some(c.peer()) && t.color == Some(TileColor::Red))
        });
    }

    c.stop();
    b.stop();
}
