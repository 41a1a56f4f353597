//! End-to-end transfer scenarios: an in-process relay server and two nodes
//! exchanging files over loopback channels.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use torshare_core::relay::{RelayServer, RelayServerConfig};
use torshare_core::{Node, NodeConfig, NodeEvent, SessionId};

async fn start_relay() -> std::net::SocketAddr {
    let server = Arc::new(RelayServer::with_config(RelayServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    }));
    let addr = server.start().await.expect("relay failed to start");
    std::mem::forget(server);
    addr
}

fn node_config(relay: std::net::SocketAddr, dir: &Path) -> NodeConfig {
    NodeConfig {
        server_addr: relay.to_string(),
        download_dir: dir.to_path_buf(),
        channel_bind: "127.0.0.1:0".to_string(),
        discovery_interval: Duration::from_millis(100),
        pacing_delay: Duration::from_millis(1),
        ..Default::default()
    }
}

/// Wait until the predicate accepts an event, failing after `secs` seconds
async fn wait_for<F, T>(
    events: &mut mpsc::UnboundedReceiver<NodeEvent>,
    secs: u64,
    mut predicate: F,
) -> T
where
    F: FnMut(&NodeEvent) -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("deadline passed while waiting for event");
        let event = timeout(remaining, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if let Some(value) = predicate(&event) {
            return value;
        }
    }
}

async fn wait_until_visible(
    events: &mut mpsc::UnboundedReceiver<NodeEvent>,
    peer: &SessionId,
) {
    let p = peer.clone();
    wait_for(events, 10, move |event| match event {
        NodeEvent::PeersUpdated(peers) if peers.contains(&p) => Some(()),
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn test_transfer_with_hash_verification_end_to_end() {
    let relay = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    // ~18 chunks at the 16 KiB default
    let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let source = dir_a.path().join("report.pdf");
    std::fs::write(&source, &content).unwrap();

    let (a, mut a_events) = Node::start(node_config(relay, dir_a.path())).await.unwrap();
    let (b, mut b_events) = Node::start(node_config(relay, dir_b.path())).await.unwrap();
    wait_until_visible(&mut a_events, b.session_id()).await;

    a.send_file(b.session_id().clone(), source.clone());

    // B sees the request and accepts
    let (from, name, size) = wait_for(&mut b_events, 10, |event| match event {
        NodeEvent::TransferRequestReceived { peer, name, size } => {
            Some((peer.clone(), name.clone(), *size))
        }
        _ => None,
    })
    .await;
    assert_eq!(&from, a.session_id());
    assert_eq!(name, "report.pdf");
    assert_eq!(size, content.len() as u64);
    b.accept(from.clone());

    // B completes with the exact byte count and a verified hash
    let received_path = wait_for(&mut b_events, 30, |event| match event {
        NodeEvent::TransferCompleted { size, path, .. } => {
            assert_eq!(*size, content.len() as u64);
            Some(path.clone().expect("incoming completion must carry a path"))
        }
        NodeEvent::TransferFailed { reason, .. } => panic!("transfer failed: {}", reason),
        _ => None,
    })
    .await;
    assert_eq!(std::fs::read(&received_path).unwrap(), content);

    // A also observes completion, with monotone progress along the way
    let mut last_bytes = 0u64;
    wait_for(&mut a_events, 30, |event| match event {
        NodeEvent::TransferProgress {
            bytes_transferred, ..
        } => {
            assert!(*bytes_transferred > last_bytes);
            last_bytes = *bytes_transferred;
            None
        }
        NodeEvent::TransferCompleted { size, .. } => {
            assert_eq!(*size, content.len() as u64);
            Some(())
        }
        NodeEvent::TransferFailed { reason, .. } => panic!("send failed: {}", reason),
        _ => None,
    })
    .await;
    assert_eq!(last_bytes, content.len() as u64);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_back_to_back_sends_queue_and_run_serially() {
    let relay = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let first = dir_a.path().join("first.bin");
    let second = dir_a.path().join("second.bin");
    std::fs::write(&first, vec![1u8; 40_000]).unwrap();
    std::fs::write(&second, vec![2u8; 20_000]).unwrap();

    let (a, mut a_events) = Node::start(node_config(relay, dir_a.path())).await.unwrap();
    let (b, mut b_events) = Node::start(node_config(relay, dir_b.path())).await.unwrap();
    wait_until_visible(&mut a_events, b.session_id()).await;

    // Both sends fired before B has responded to anything
    a.send_file(b.session_id().clone(), first);
    a.send_file(b.session_id().clone(), second);

    // B must see exactly one request now: the second is queued at A
    let name = wait_for(&mut b_events, 10, |event| match event {
        NodeEvent::TransferRequestReceived { name, .. } => Some(name.clone()),
        _ => None,
    })
    .await;
    assert_eq!(name, "first.bin");
    b.accept(a.session_id().clone());

    // The first transfer completes on A before the second request exists
    wait_for(&mut a_events, 30, |event| match event {
        NodeEvent::TransferCompleted { name, .. } => {
            assert_eq!(name, "first.bin");
            Some(())
        }
        NodeEvent::TransferFailed { reason, .. } => panic!("first send failed: {}", reason),
        _ => None,
    })
    .await;

    // Only now is the queued request transmitted
    let name = wait_for(&mut b_events, 10, |event| match event {
        NodeEvent::TransferRequestReceived { name, .. } => Some(name.clone()),
        NodeEvent::TransferFailed { reason, .. } => panic!("unexpected failure: {}", reason),
        _ => None,
    })
    .await;
    assert_eq!(name, "second.bin");
    b.accept(a.session_id().clone());

    wait_for(&mut a_events, 30, |event| match event {
        NodeEvent::TransferCompleted { name, .. } => {
            assert_eq!(name, "second.bin");
            Some(())
        }
        NodeEvent::TransferFailed { reason, .. } => panic!("second send failed: {}", reason),
        _ => None,
    })
    .await;

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_rejection_leaves_receiver_disk_untouched() {
    let relay = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let source = dir_a.path().join("unwanted.bin");
    std::fs::write(&source, vec![9u8; 10_000]).unwrap();

    let (a, mut a_events) = Node::start(node_config(relay, dir_a.path())).await.unwrap();
    let (b, mut b_events) = Node::start(node_config(relay, dir_b.path())).await.unwrap();
    wait_until_visible(&mut a_events, b.session_id()).await;

    a.send_file(b.session_id().clone(), source);

    wait_for(&mut b_events, 10, |event| match event {
        NodeEvent::TransferRequestReceived { .. } => Some(()),
        _ => None,
    })
    .await;
    b.reject(a.session_id().clone());

    // A's session ends Rejected well inside the response window
    wait_for(&mut a_events, 10, |event| match event {
        NodeEvent::TransferRejected { name, .. } => {
            assert_eq!(name, "unwanted.bin");
            Some(())
        }
        NodeEvent::TransferCompleted { .. } => panic!("rejected transfer completed"),
        _ => None,
    })
    .await;

    // B's download directory stays empty
    let entries: Vec<_> = std::fs::read_dir(dir_b.path()).unwrap().collect();
    assert!(entries.is_empty());

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_transfers_to_two_peers_run_concurrently() {
    let relay = start_relay().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();

    let for_b = dir_a.path().join("for-b.bin");
    let for_c = dir_a.path().join("for-c.bin");
    std::fs::write(&for_b, vec![1u8; 50_000]).unwrap();
    std::fs::write(&for_c, vec![2u8; 50_000]).unwrap();

    let (a, mut a_events) = Node::start(node_config(relay, dir_a.path())).await.unwrap();
    let (b, mut b_events) = Node::start(node_config(relay, dir_b.path())).await.unwrap();
    let (c, mut c_events) = Node::start(node_config(relay, dir_c.path())).await.unwrap();
    wait_until_visible(&mut a_events, b.session_id()).await;
    wait_until_visible(&mut a_events, c.session_id()).await;

    a.send_file(b.session_id().clone(), for_b);
    a.send_file(c.session_id().clone(), for_c);

    wait_for(&mut b_events, 10, |event| match event {
        NodeEvent::TransferRequestReceived { .. } => Some(()),
        _ => None,
    })
    .await;
    wait_for(&mut c_events, 10, |event| match event {
        NodeEvent::TransferRequestReceived { .. } => Some(()),
        _ => None,
    })
    .await;
    b.accept(a.session_id().clone());
    c.accept(a.session_id().clone());

    let mut completed = std::collections::HashSet::new();
    while completed.len() < 2 {
        let peer = wait_for(&mut a_events, 30, |event| match event {
            NodeEvent::TransferCompleted { peer, .. } => Some(peer.clone()),
            NodeEvent::TransferFailed { reason, .. } => panic!("transfer failed: {}", reason),
            _ => None,
        })
        .await;
        completed.insert(peer);
    }
    assert!(completed.contains(b.session_id()));
    assert!(completed.contains(c.session_id()));

    a.shutdown();
    b.shutdown();
    c.shutdown();
}
