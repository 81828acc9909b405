//! Exclusive takeover of orphaned sessions.

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::helpers::{self, TestServer};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn concurrent_claims_elect_exactly_one_winner() {
    let server = TestServer::start();
    let hb = Duration::from_millis(300);

    let owner = server.worker("111", hb).await;
    let owner_scope = CancellationToken::new();
    let (mut owner_sessions, _owner_exp) = owner.init(&owner_scope).await.unwrap();

    helpers::announce(&server, "session1", json!({"key1": "value1"})).await;

    let assigned = timeout(RECV_TIMEOUT, owner_sessions.recv())
        .await
        .expect("owner received no session")
        .unwrap();
    assert_eq!(assigned.envelope.data_stream_name, "session1");

    // the successors join only after the owner holds the session, so the
    // announcement cannot have been delivered to them
    let w2 = server.worker("222", hb).await;
    let w3 = server.worker("333", hb).await;
    let survivor_scope = CancellationToken::new();
    let (_sessions2, mut expirations2) = w2.init(&survivor_scope).await.unwrap();
    let (_sessions3, _expirations3) = w3.init(&survivor_scope).await.unwrap();

    // crash the owner: heartbeats stop and the key expires on its own
    owner_scope.cancel();

    let expired_key = helpers::wait_for_session_key(&mut expirations2).await;
    assert!(expired_key.starts_with("session1:"));

    let (r2, r3) = tokio::join!(w2.claim(&expired_key), w3.claim(&expired_key));

    let winners = [r2.is_ok(), r3.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1, "exactly one successor must win the claim");

    let loser = if r2.is_ok() { r3 } else { r2 };
    assert!(matches!(loser, Err(tether::Error::AlreadyClaimed)));

    w2.close();
    w3.close();
}

#[tokio::test]
async fn claim_rejects_payloads_without_separator() {
    let server = TestServer::start();
    let worker = server.worker("111", Duration::from_secs(1)).await;

    // a random expired key that is not a session key
    let err = worker.claim("some-cache-entry").await.unwrap_err();
    assert!(matches!(err, tether::Error::InvalidPayload(_)));
}

#[tokio::test]
async fn claiming_a_live_session_is_rejected() {
    let server = TestServer::start();
    let hb = Duration::from_secs(2);

    let owner = server.worker("111", hb).await;
    let scope = CancellationToken::new();
    let (mut owner_sessions, _exp1) = owner.init(&scope).await.unwrap();

    // the rival never joins the group read loop, it only contests the claim
    let rival = server.worker("222", hb).await;

    helpers::announce(&server, "session1", json!({})).await;
    let assigned = timeout(RECV_TIMEOUT, owner_sessions.recv())
        .await
        .expect("owner received no session")
        .unwrap();

    // the owner is alive, so its heartbeat key still stands
    let key = format!("session1:{}", assigned.entry_id);
    let err = rival.claim(&key).await.unwrap_err();
    assert!(matches!(err, tether::Error::AlreadyClaimed));

    owner.close();
    rival.close();
}
