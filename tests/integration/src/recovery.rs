//! Crash-recovery takeover, end to end.

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::helpers::{self, TestServer};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn survivor_takes_over_crashed_workers_session() {
    let server = TestServer::start();
    let hb = Duration::from_millis(300);

    let crashing_scope = CancellationToken::new();
    let surviving_scope = CancellationToken::new();

    let w1 = server.worker("111", hb).await;
    let (mut sessions1, _expirations1) = w1.init(&crashing_scope).await.unwrap();
    let w2 = server.worker("222", hb).await;
    let (mut sessions2, mut expirations2) = w2.init(&surviving_scope).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    helpers::announce(&server, "session1", json!({"key1": "value1"})).await;
    helpers::announce(&server, "session2", json!({"key1": "value2"})).await;

    let picked1 = timeout(RECV_TIMEOUT, sessions1.recv())
        .await
        .expect("worker 111 received no session")
        .unwrap();
    let picked2 = timeout(RECV_TIMEOUT, sessions2.recv())
        .await
        .expect("worker 222 received no session")
        .unwrap();
    assert_eq!(w1.streams_owned().len(), 1);
    assert_eq!(w2.streams_owned().len(), 1);

    // crash worker 111; its heartbeat key is never extended again
    crashing_scope.cancel();

    let expired_key = helpers::wait_for_session_key(&mut expirations2).await;
    assert!(expired_key.contains("session"));
    assert!(
        expired_key.starts_with(&picked1.envelope.data_stream_name),
        "the orphaned session must be the crashed worker's"
    );

    w2.claim(&expired_key).await.unwrap();
    assert_eq!(w2.streams_owned().len(), 2);

    // backend-side, both pending entries are now attributed to the survivor
    let consumers = helpers::group_consumers(&server).await;
    let pending_of = |name: &str| {
        consumers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, pending)| *pending)
    };
    assert_eq!(pending_of("redis-consumer-222"), Some(2));
    assert_eq!(pending_of("redis-consumer-111"), Some(0));

    // the survivor settles both sessions
    w2.done(&picked1.envelope.data_stream_name).await.unwrap();
    w2.done(&picked2.envelope.data_stream_name).await.unwrap();
    assert!(w2.streams_owned().is_empty());

    let consumers = helpers::group_consumers(&server).await;
    let survivor_pending = consumers
        .iter()
        .find(|(n, _)| n == "redis-consumer-222")
        .map(|(_, pending)| *pending);
    assert_eq!(survivor_pending, Some(0), "every entry must be acknowledged");

    w2.close();
}
