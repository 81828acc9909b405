//! Test helpers for spawning a redis-server and driving workers against it.

use std::collections::HashMap;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tether::Tether;

/// Service name shared by every test worker. The backend state it implies:
/// stream `consumer-input`, group `consumer-group`.
pub const SERVICE: &str = "consumer";

/// A redis-server subprocess managed by the test harness.
///
/// Every test gets its own server on its own port, so tests stay
/// independent and can run in parallel.
pub struct TestServer {
    child: Child,
    pub port: u16,
}

impl TestServer {
    /// Starts a redis-server on a random free port.
    ///
    /// Blocks until the server is accepting connections (up to 5 seconds).
    pub fn start() -> Self {
        let port = find_free_port();

        let child = Command::new("redis-server")
            .arg("--port")
            .arg(port.to_string())
            .arg("--save")
            .arg("")
            .arg("--appendonly")
            .arg("no")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to spawn redis-server: {e}"));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if std::time::Instant::now() > deadline {
                panic!("redis-server failed to start within 5 seconds on port {port}");
            }
            if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        Self { child, port }
    }

    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }

    pub fn client(&self) -> redis::Client {
        redis::Client::open(self.url()).expect("invalid redis url")
    }

    /// Builds a worker with the given pod name against this server.
    ///
    /// The identity environment is process-global, so construction is
    /// serialized across tests.
    pub async fn worker(&self, pod_name: &str, hb_interval: Duration) -> Tether {
        let _guard = env_lock();
        std::env::set_var("POD_NAME", pod_name);
        Tether::new(self.client(), hb_interval, SERVICE)
            .await
            .expect("worker construction failed")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Serializes access to the identity environment variables.
pub fn env_lock() -> MutexGuard<'static, ()> {
    static ENV_LOCK: Mutex<()> = Mutex::new(());
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publishes a session announcement the way an external producer would:
/// a raw XADD of the serialized envelope. Returns the entry id.
pub async fn announce(server: &TestServer, session: &str, info: serde_json::Value) -> String {
    let payload = serde_json::json!({
        "data_stream_name": session,
        "info": info,
    })
    .to_string();

    let mut conn = server
        .client()
        .get_multiplexed_async_connection()
        .await
        .expect("failed to connect producer");

    redis::cmd("XADD")
        .arg("consumer-input")
        .arg("*")
        .arg("lbs_input")
        .arg(&payload)
        .query_async(&mut conn)
        .await
        .expect("XADD failed")
}

/// Writes a plain key with a TTL, to trigger an expiry notification.
pub async fn set_with_ttl(server: &TestServer, key: &str, value: &str, ttl: Duration) {
    let mut conn = server
        .client()
        .get_multiplexed_async_connection()
        .await
        .expect("failed to connect");

    let _: () = redis::cmd("SET")
        .arg(key)
        .arg(value)
        .arg("PX")
        .arg(ttl.as_millis() as u64)
        .query_async(&mut conn)
        .await
        .expect("SET failed");
}

/// Returns `(consumer name, pending count)` for every consumer of the
/// ingress group, via XINFO CONSUMERS.
pub async fn group_consumers(server: &TestServer) -> Vec<(String, i64)> {
    let mut conn = server
        .client()
        .get_multiplexed_async_connection()
        .await
        .expect("failed to connect");

    let consumers: Vec<HashMap<String, redis::Value>> = redis::cmd("XINFO")
        .arg("CONSUMERS")
        .arg("consumer-input")
        .arg("consumer-group")
        .query_async(&mut conn)
        .await
        .expect("XINFO CONSUMERS failed");

    consumers
        .into_iter()
        .map(|fields| {
            let name: String =
                redis::from_redis_value(&fields["name"]).expect("consumer name not a string");
            let pending: i64 =
                redis::from_redis_value(&fields["pending"]).expect("pending not an integer");
            (name, pending)
        })
        .collect()
}

/// Receives from the expiry channel until a session key (payload with a
/// `':'`) arrives, panicking after five seconds.
pub async fn wait_for_session_key(rx: &mut tokio::sync::mpsc::Receiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(key) if key.contains(':') => return key,
                Some(_) => continue,
                None => panic!("expiry channel closed before a session key arrived"),
            }
        }
    })
    .await
    .expect("no expiry notification within 5 seconds")
}

/// Finds a free TCP port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind probe socket");
    listener.local_addr().expect("no local addr").port()
}
