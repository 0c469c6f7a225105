//! End-to-end tests against an in-process daemon, exercised over real
//! sockets.

use std::time::Duration;

use quarry_sync::{Server, ServerConfig, SocketFamily, SyncClient, SyncClientConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const LONG: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(150);

async fn start_server(idle_timeout: Duration) -> (String, JoinHandle<std::io::Result<()>>) {
    let server = Server::bind(ServerConfig {
        family: SocketFamily::Inet,
        idle_timeout,
        debug: false,
    })
    .await
    .unwrap();
    let address = server.address().to_string();
    (address, tokio::spawn(server.serve()))
}

async fn connect(address: &str) -> SyncClient {
    SyncClient::connect(SyncClientConfig {
        family: SocketFamily::Inet,
        address: Some(address.to_string()),
        ..SyncClientConfig::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn shared_holders_proceed_together() {
    let (address, server) = start_server(Duration::from_secs(300)).await;
    let first = connect(&address).await;
    let second = connect(&address).await;

    let first_context = first.new_context(true).await.unwrap();
    let second_context = second.new_context(true).await.unwrap();

    timeout(LONG, first_context.acquire(["artifact.lock"]))
        .await
        .unwrap()
        .unwrap();
    timeout(LONG, second_context.acquire(["artifact.lock"]))
        .await
        .unwrap()
        .unwrap();

    first_context.close().await.unwrap();
    second_context.close().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn exclusive_waits_for_all_shared_holders() {
    let (address, server) = start_server(Duration::from_secs(300)).await;
    let a = connect(&address).await;
    let b = connect(&address).await;
    let c = connect(&address).await;

    let a_context = a.new_context(true).await.unwrap();
    let b_context = b.new_context(true).await.unwrap();
    a_context.acquire(["key"]).await.unwrap();
    b_context.acquire(["key"]).await.unwrap();

    let c_context = c.new_context(false).await.unwrap();
    let waiting = c_context.clone();
    let exclusive = tokio::spawn(async move { waiting.acquire(["key"]).await });

    sleep(SETTLE).await;
    assert!(!exclusive.is_finished(), "exclusive must block behind shared");

    a_context.close().await.unwrap();
    sleep(SETTLE).await;
    assert!(!exclusive.is_finished(), "one shared holder remains");

    b_context.close().await.unwrap();
    timeout(LONG, exclusive).await.unwrap().unwrap().unwrap();

    c_context.close().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn cancelled_waiter_is_silent_and_skipped() {
    let (address, server) = start_server(Duration::from_secs(300)).await;
    let client = connect(&address).await;

    let holder = client.new_context(false).await.unwrap();
    holder.acquire(["key"]).await.unwrap();

    let waiter = client.new_context(false).await.unwrap();
    let waiting = waiter.clone();
    let cancelled = tokio::spawn(async move { waiting.acquire(["key"]).await });
    sleep(SETTLE).await;
    assert!(!cancelled.is_finished());

    // closing the context cancels the queued wait; the acquire gets no
    // response at all
    waiter.close().await.unwrap();
    sleep(SETTLE).await;
    assert!(!cancelled.is_finished(), "cancelled waits receive no reply");

    // and the next waiter is not delayed by the cancelled one
    let successor = client.new_context(false).await.unwrap();
    let succeeding = successor.clone();
    let granted = tokio::spawn(async move { succeeding.acquire(["key"]).await });
    sleep(SETTLE).await;

    holder.close().await.unwrap();
    timeout(LONG, granted).await.unwrap().unwrap().unwrap();

    cancelled.abort();
    successor.close().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn disconnect_releases_every_held_key() {
    let (address, server) = start_server(Duration::from_secs(300)).await;

    let holder = connect(&address).await;
    let holder_context = holder.new_context(false).await.unwrap();
    holder_context
        .acquire(["key-a", "key-b", "key-c"])
        .await
        .unwrap();

    let other = connect(&address).await;
    let other_context = other.new_context(false).await.unwrap();

    // dropping the client and its context closes the connection, which the
    // daemon treats as an implicit close
    drop(holder_context);
    drop(holder);

    timeout(LONG, other_context.acquire(["key-a", "key-b", "key-c"]))
        .await
        .expect("implicit close must release all keys")
        .unwrap();

    other_context.close().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn keys_are_sorted_so_crossed_acquisitions_cannot_deadlock() {
    let (address, server) = start_server(Duration::from_secs(300)).await;
    let left = connect(&address).await;
    let right = connect(&address).await;

    for _ in 0..16 {
        let left_context = left.new_context(false).await.unwrap();
        let right_context = right.new_context(false).await.unwrap();

        let crossing = tokio::spawn(async move {
            left_context.acquire(["beta", "alpha"]).await.unwrap();
            left_context.close().await.unwrap();
        });
        right_context.acquire(["alpha", "beta"]).await.unwrap();
        right_context.close().await.unwrap();
        timeout(LONG, crossing).await.unwrap().unwrap();
    }
    server.abort();
}

#[tokio::test]
async fn idle_daemon_expires() {
    let (_address, server) = start_server(Duration::from_millis(300)).await;
    let outcome = timeout(Duration::from_secs(3), server)
        .await
        .expect("daemon must expire on its own")
        .unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn connected_client_prevents_expiry() {
    let (address, server) = start_server(Duration::from_millis(300)).await;
    let client = connect(&address).await;

    sleep(Duration::from_millis(900)).await;
    assert!(!server.is_finished(), "a connected client must keep the daemon alive");

    drop(client);
    let outcome = timeout(Duration::from_secs(3), server)
        .await
        .expect("daemon must expire after the last client leaves")
        .unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn stop_shuts_the_daemon_down() {
    let (address, server) = start_server(Duration::from_secs(300)).await;
    let client = connect(&address).await;

    client.stop().await.unwrap();
    let outcome = timeout(LONG, server).await.unwrap().unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn malformed_frame_closes_only_the_offending_connection() {
    let (address, server) = start_server(Duration::from_secs(300)).await;
    let healthy = connect(&address).await;
    let context = healthy.new_context(true).await.unwrap();
    context.acquire(["key"]).await.unwrap();

    // a frame announcing an absurd argument count
    let mut rogue = tokio::net::TcpStream::connect(&address).await.unwrap();
    rogue.write_u32(1).await.unwrap();
    rogue.write_u32(u32::MAX).await.unwrap();
    rogue.flush().await.unwrap();

    let mut buffer = [0u8; 16];
    let read = timeout(LONG, rogue.read(&mut buffer))
        .await
        .expect("daemon must close the offending connection")
        .unwrap();
    assert_eq!(read, 0, "expected EOF from the daemon");

    // the healthy connection is unaffected
    context.close().await.unwrap();
    let again = healthy.new_context(false).await.unwrap();
    timeout(LONG, again.acquire(["key"])).await.unwrap().unwrap();
    again.close().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn no_fork_runs_the_daemon_in_process() {
    let client = SyncClient::connect(SyncClientConfig {
        family: SocketFamily::Inet,
        no_fork: true,
        idle_timeout: Duration::from_millis(500),
        ..SyncClientConfig::default()
    })
    .await
    .unwrap();

    let context = client.new_context(false).await.unwrap();
    timeout(LONG, context.acquire(["key"])).await.unwrap().unwrap();
    context.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn unix_sockets_work_end_to_end() {
    let server = Server::bind(ServerConfig {
        family: SocketFamily::Unix,
        idle_timeout: Duration::from_secs(300),
        debug: false,
    })
    .await
    .unwrap();
    let address = server.address().to_string();
    let serving = tokio::spawn(server.serve());

    let client = SyncClient::connect(SyncClientConfig {
        family: SocketFamily::Unix,
        address: Some(address),
        ..SyncClientConfig::default()
    })
    .await
    .unwrap();

    let context = client.new_context(true).await.unwrap();
    timeout(LONG, context.acquire(["key"])).await.unwrap().unwrap();
    context.close().await.unwrap();
    serving.abort();
}
