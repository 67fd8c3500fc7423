//! Integration tests for bounded reconnection of outbound links.

use std::time::{Duration, Instant};

use anyhow::Result;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_util::codec::FramedRead;

use replica_mesh::config::ReconnectPolicy;
use replica_mesh::connection::ConnectionManager;
use replica_mesh::identity::PeerIdentity;
use replica_mesh::link::PeerLink;
use replica_mesh::operation::Operation;
use replica_mesh::view::{MembershipView, SharedView};
use replica_mesh::wire::{Envelope, EnvelopeCodec};

/// A localhost port nothing is listening on.
fn unused_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

async fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            anyhow::bail!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[tokio::test]
async fn manager_gives_up_after_max_attempts() -> Result<()> {
    let local = PeerIdentity::new(1, "127.0.0.1", 17201);
    let unreachable = PeerIdentity::new(2, "127.0.0.1", unused_port()?);
    let view = SharedView::new(MembershipView::from_members([local.clone(), unreachable.clone()]));
    let policy = ReconnectPolicy {
        interval: Duration::from_millis(10),
        max_attempts: 3,
        ..ReconnectPolicy::default()
    };

    let mut manager = ConnectionManager::new(local, view, policy);
    manager.connect(unreachable);

    wait_until("link to give up", Duration::from_secs(5), || {
        manager.link(2).is_some_and(PeerLink::is_exhausted)
    })
    .await?;

    let status = manager.link(2).map(PeerLink::status).expect("link exists");
    assert_eq!(status.attempts(), 3);
    assert!(!status.is_reconnecting());
    assert!(!manager.is_active(2));

    // No further attempts once the budget is spent.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status.attempts(), 3);
    Ok(())
}

#[tokio::test]
async fn link_connects_once_the_peer_comes_up() -> Result<()> {
    let port = unused_port()?;
    let peer = PeerIdentity::new(2, "127.0.0.1", port);
    let policy = ReconnectPolicy {
        interval: Duration::from_millis(20),
        max_attempts: 100,
        ..ReconnectPolicy::default()
    };

    let link = PeerLink::spawn(peer, policy);
    assert!(link.send(Envelope::signed(1, &b"queued"[..], &b"sig"[..])));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!link.is_active());

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await??;
    wait_until("link to become active", Duration::from_secs(5), || link.is_active()).await?;

    let mut frames = FramedRead::new(stream, EnvelopeCodec);
    let frame = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await?
        .expect("frame before close")?;
    assert_eq!(frame, Envelope::signed(1, &b"queued"[..], &b"sig"[..]));
    assert!(link.status().attempts() > 1);
    Ok(())
}

#[tokio::test]
async fn link_recovers_after_the_connection_drops() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let peer = PeerIdentity::new(2, "127.0.0.1", listener.local_addr()?.port());
    let policy = ReconnectPolicy {
        interval: Duration::from_millis(20),
        max_attempts: 100,
        ..ReconnectPolicy::default()
    };

    let link = PeerLink::spawn(peer, policy);
    let (first, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await??;
    wait_until("link to become active", Duration::from_secs(5), || link.is_active()).await?;

    // The link reconnects on its own; a second accept proves it.
    drop(first);
    let (second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await??;
    wait_until("link to come back", Duration::from_secs(5), || link.is_active()).await?;
    assert!(link.send(Envelope::signed(1, &b"after"[..], &b"sig"[..])));

    let mut frames = FramedRead::new(second, EnvelopeCodec);
    let frame = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await?
        .expect("frame before close")?;
    assert_eq!(frame.payload.as_ref(), b"after");
    assert!(!link.is_exhausted());
    Ok(())
}

#[tokio::test]
async fn disconnect_closes_the_link_but_keeps_the_member() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let local = PeerIdentity::new(1, "127.0.0.1", 17211);
    let peer = PeerIdentity::new(2, "127.0.0.1", port);
    let view = SharedView::new(MembershipView::from_members([local.clone(), peer.clone()]));

    let mut manager = ConnectionManager::new(local, view.clone(), ReconnectPolicy::default());
    manager.execute(Operation::Connect { peer: peer.clone() });
    let (mut accepted, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await??;
    wait_until("link to become active", Duration::from_secs(5), || manager.is_active(2)).await?;

    // A second connect to a live peer is a no-op.
    manager.execute(Operation::Connect { peer });
    assert!(manager.is_active(2));

    manager.execute(Operation::Disconnect { peer: 2 });
    assert!(manager.link(2).is_none());
    assert!(view.read(|view| view.contains(2)));

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read(&mut accepted, &mut buf),
    )
    .await??;
    assert_eq!(read, 0, "peer should see the connection close");
    Ok(())
}
