//! In-memory queue server semantics.

use std::sync::Arc;
use std::time::Duration;

use juggler::model::{JobId, PutOptions};
use juggler::queue::memory::{JobStatus, MemoryServer};
use juggler::queue::{ConnectionState, QueueClient, QueueError, ReserveError};
use tokio::time::{advance, timeout};

async fn connected(server: &MemoryServer, tube: &str) -> Arc<dyn QueueClient> {
    let client: Arc<dyn QueueClient> = server.client();
    client.connect().await.unwrap();
    client.watch(tube).await.unwrap();
    client
}

fn opts(priority: u32, delay: u32, ttr: u32) -> PutOptions {
    PutOptions {
        priority,
        delay,
        ttr,
    }
}

#[tokio::test(start_paused = true)]
async fn test_priority_then_fifo() {
    let server = MemoryServer::default();
    let client = connected(&server, "t").await;

    let low = client.put("t", b"low".to_vec(), opts(100, 0, 10)).await.unwrap();
    let first = client.put("t", b"a".to_vec(), opts(10, 0, 10)).await.unwrap();
    let second = client.put("t", b"b".to_vec(), opts(10, 0, 10)).await.unwrap();

    assert_eq!(client.reserve().await.unwrap().id, first);
    assert_eq!(client.reserve().await.unwrap().id, second);
    assert_eq!(client.reserve().await.unwrap().id, low);
}

#[tokio::test(start_paused = true)]
async fn test_only_watched_tubes_are_reserved() {
    let server = MemoryServer::default();
    let client = connected(&server, "mine").await;
    client.put("other", b"x".to_vec(), opts(1, 0, 10)).await.unwrap();

    let blocked = timeout(Duration::from_secs(5), client.reserve()).await;
    assert!(blocked.is_err(), "reserved a job from an unwatched tube");

    let id = client.put("mine", b"y".to_vec(), opts(1, 0, 10)).await.unwrap();
    assert_eq!(client.reserve().await.unwrap().id, id);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_job_becomes_ready() {
    let server = MemoryServer::default();
    let client = connected(&server, "t").await;
    let id = client.put("t", b"later".to_vec(), opts(1, 3, 10)).await.unwrap();

    assert_eq!(server.count(JobStatus::Delayed), 1);
    assert_eq!(server.job(id).unwrap().time_left, 3);

    let started = tokio::time::Instant::now();
    let job = client.reserve().await.unwrap();
    assert_eq!(job.id, id);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_expired_reservation_returns_to_ready() {
    let server = MemoryServer::default();
    let holder = connected(&server, "t").await;
    let id = holder.put("t", b"x".to_vec(), opts(1, 0, 2)).await.unwrap();
    holder.reserve().await.unwrap();

    advance(Duration::from_secs(3)).await;

    let stats = server.job(id).unwrap();
    assert_eq!(stats.state, "ready");
    assert_eq!(stats.timeouts, 1);
    assert_eq!(server.stats().timeouts, 1);
    assert_eq!(
        holder.release(id, 0).await.unwrap_err(),
        QueueError::NotFound(id)
    );
}

#[tokio::test(start_paused = true)]
async fn test_deadline_soon_within_safety_margin() {
    let server = MemoryServer::default();
    let client = connected(&server, "t").await;
    client.put("t", b"x".to_vec(), opts(1, 0, 3)).await.unwrap();
    client.reserve().await.unwrap();

    // Blocks until the held job is within one second of its deadline.
    let started = tokio::time::Instant::now();
    let err = client.reserve().await.unwrap_err();

    assert_eq!(err, ReserveError::DeadlineSoon);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3), "{waited:?}");
}

#[tokio::test(start_paused = true)]
async fn test_release_and_bury_require_ownership() {
    let server = MemoryServer::default();
    let owner = connected(&server, "t").await;
    let other = connected(&server, "t").await;
    let id = owner.put("t", b"x".to_vec(), opts(5, 0, 10)).await.unwrap();
    owner.reserve().await.unwrap();

    assert_eq!(other.release(id, 0).await, Err(QueueError::NotFound(id)));
    assert_eq!(other.bury(id, 1).await, Err(QueueError::NotFound(id)));
    assert_eq!(other.delete(id).await, Err(QueueError::NotFound(id)));

    owner.bury(id, 7).await.unwrap();
    let stats = server.job(id).unwrap();
    assert_eq!(stats.state, "buried");
    assert_eq!(stats.pri, 7);
    assert_eq!(stats.buries, 1);
    assert!(server.is_drained());
}

#[tokio::test(start_paused = true)]
async fn test_release_records_delay_for_stats() {
    let server = MemoryServer::default();
    let client = connected(&server, "t").await;
    let id = client.put("t", b"x".to_vec(), opts(5, 0, 10)).await.unwrap();
    client.reserve().await.unwrap();

    let reserved = client.stats(id).await.unwrap();
    assert_eq!(reserved.state, "reserved");
    assert_eq!(reserved.time_left, 10);
    assert_eq!(reserved.delay, 0);

    client.release(id, 4).await.unwrap();
    let released = client.stats(id).await.unwrap();
    assert_eq!(released.state, "delayed");
    assert_eq!(released.delay, 4);
    assert_eq!(released.releases, 1);

    client.delete(id).await.unwrap();
    assert_eq!(client.stats(id).await.unwrap_err(), QueueError::NotFound(id));
    assert_eq!(client.delete(JobId(999)).await, Err(QueueError::NotFound(JobId(999))));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_client_abandons_reservations() {
    let server = MemoryServer::default();
    let client = connected(&server, "t").await;
    let id = client.put("t", b"x".to_vec(), opts(5, 0, 60)).await.unwrap();
    client.reserve().await.unwrap();

    drop(client);

    assert_eq!(server.job(id).unwrap().state, "ready");
}

#[tokio::test(start_paused = true)]
async fn test_sever_and_restore() {
    let server = MemoryServer::default();
    let client = connected(&server, "t").await;
    let id = client.put("t", b"x".to_vec(), opts(5, 0, 60)).await.unwrap();
    client.reserve().await.unwrap();

    let mut state = client.connection();
    let waiting = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.reserve().await }
    });
    tokio::task::yield_now().await;

    server.sever_connections();

    assert_eq!(waiting.await.unwrap().unwrap_err(), ReserveError::Disconnected);
    assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
    assert_eq!(server.job(id).unwrap().state, "ready");
    assert_eq!(
        client.put("t", b"y".to_vec(), opts(1, 0, 1)).await,
        Err(QueueError::Disconnected)
    );
    let fresh: Arc<dyn QueueClient> = server.client();
    assert_eq!(fresh.connect().await, Err(QueueError::Disconnected));

    server.restore_connections();

    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);
    assert_eq!(client.reserve().await.unwrap().id, id);
}
