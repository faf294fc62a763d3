//! Multi-connection reconnection fold-in:
//! several live connections each receive exactly one replacement channel
//! fd over their link socket, carrying a token with `UPDATE` set and the
//! original session key.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};

use shadowlink::channel;
use shadowlink::reconnect::migrate_connections;
use shadowlink::supervisor::ConnectionRecord;
use shadowlink::token::ConnectionToken;

#[test]
fn s4_migrate_connections_delivers_one_update_token_and_fd_each() {
    let dir = tempfile::tempdir().expect("tempdir");
    let endpoint = dir.path().join("new-channel.sock");
    let listener = UnixListener::bind(&endpoint).expect("bind new endpoint");

    let mut connections = Vec::new();
    let mut our_ends_by_key: HashMap<[u32; 3], UnixStream> = HashMap::new();

    for i in 0..3u32 {
        let token = ConnectionToken::mint(true, [i, 0, 0]);
        let (our_end, their_end) = UnixStream::pair().expect("link socketpair");
        connections.push(ConnectionRecord {
            token,
            child_pid: 1000 + i as i32,
            link_fd: their_end,
        });
        our_ends_by_key.insert(token.key, our_end);
    }

    let outcomes = migrate_connections(&connections, &endpoint);
    assert_eq!(outcomes.len(), 3);
    assert!(
        outcomes.iter().all(|o| o.migrated),
        "every connection should migrate cleanly when the new endpoint is reachable: {outcomes:?}"
    );

    for _ in 0..3 {
        let (mut accepted, _) = listener.accept().expect("accept replacement channel");
        let got = channel::read_token(&mut accepted).expect("read token");
        assert!(got.is_update(), "replacement channel token must have UPDATE set");

        let our_end = our_ends_by_key
            .get(&got.key)
            .expect("token key must match one of the original connections");
        let received_fd = channel::recv_one_fd(our_end).expect("recv fd over link socket");
        assert!(received_fd.as_raw_fd() >= 0);
    }
}

#[test]
fn s4_migration_to_an_unreachable_endpoint_is_reported_not_panicked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let unreachable = dir.path().join("nobody-listening.sock");

    let token = ConnectionToken::mint(true, [7, 0, 0]);
    let (_our_end, their_end) = UnixStream::pair().expect("link socketpair");
    let connections = vec![ConnectionRecord {
        token,
        child_pid: 4242,
        link_fd: their_end,
    }];

    let outcomes = migrate_connections(&connections, &unreachable);
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].migrated);
    assert!(outcomes[0].error.is_some());
}
