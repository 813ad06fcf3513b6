//! Peer calls over real sockets: timeouts, channel replacement, and the
//! session check in front of an application.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use vigil::errors::Result;
use vigil::gateway::frontend::{Frontend, Reply, WorkItem, WorkUnit, UPSTREAM_UNAVAILABLE};
use vigil::gateway::session::{
    CredentialVerifier, MemorySessionStore, SessionAuthority, SessionClient, UserRecord,
};
use vigil::gateway::{CallError, PeerCallGateway, PeerServer, UnixConnector};

#[test]
fn test_timeout_then_fresh_channel_gets_its_own_reply() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("peer.sock");
    let first = Arc::new(AtomicBool::new(true));
    let _server = PeerServer::bind(&path, move |request: &[u8]| {
        if first.swap(false, Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(400));
        }
        request.to_vec()
    })
    .expect("Failed to bind peer server");

    let mut gateway = PeerCallGateway::new(UnixConnector::new(&path));
    let before = gateway.channel_id();

    let err = gateway
        .call(b"first", Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout { timeout_ms: 100 }));
    let after = gateway.channel_id();
    assert!(after.is_some());
    assert_ne!(after, before);

    // The late reply to "first" lands on the discarded channel.
    let reply = gateway
        .call(b"second", Duration::from_secs(2))
        .expect("Second call failed");
    assert_eq!(reply, b"second");
    assert_eq!(gateway.channel_id(), after);
}

struct Users;

impl CredentialVerifier for Users {
    fn verify(&self, username: &str, password: &str) -> Result<Option<UserRecord>> {
        Ok((username == "admin" && password == "hunter2").then(|| UserRecord {
            id: "user-1".to_string(),
            username: username.to_string(),
        }))
    }
}

fn request(cookie: Option<&str>) -> WorkItem {
    let mut headers = BTreeMap::new();
    headers.insert("host".to_string(), "example.test".to_string());
    if let Some(cookie) = cookie {
        headers.insert("cookie".to_string(), cookie.to_string());
    }
    WorkItem::Unit(WorkUnit {
        method: "GET".to_string(),
        path: "/dash".to_string(),
        query: None,
        headers,
        body: Vec::new(),
    })
}

#[test]
fn test_frontend_gates_on_session_authority() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("auth.sock");

    let mut authority = SessionAuthority::new(MemorySessionStore::new(), "/login");
    let key = authority
        .login(&Users, "admin", "hunter2")
        .expect("Login failed");
    let authority = Arc::new(Mutex::new(authority));

    let served = Arc::clone(&authority);
    let _server = PeerServer::bind(&path, move |request: &[u8]| match served.lock() {
        Ok(authority) => authority.handle(request),
        Err(_) => Vec::new(),
    })
    .expect("Failed to bind auth server");

    let sessions = SessionClient::new(
        PeerCallGateway::new(UnixConnector::new(&path)),
        Duration::from_secs(2),
    );
    let mut frontend = Frontend::new(sessions, |_: &WorkUnit| Reply::ok("dashboard"));

    let allowed = frontend
        .handle(request(Some(&format!("session={key}"))))
        .unwrap();
    assert_eq!(allowed.status, 200);
    assert_eq!(allowed.body, b"dashboard");

    let anonymous = frontend.handle(request(None)).unwrap();
    assert_eq!(anonymous.status, 302);
    assert_eq!(
        anonymous.header("Location"),
        Some("/login?redirect=http%3A%2F%2Fexample.test%2Fdash")
    );

    let forged = frontend
        .handle(request(Some("session=not-a-session")))
        .unwrap();
    assert_eq!(forged.status, 302);

    assert_eq!(frontend.handle(WorkItem::Disconnect), None);
}

#[test]
fn test_frontend_reports_missing_authority() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let sessions = SessionClient::new(
        PeerCallGateway::new(UnixConnector::new(temp_dir.path().join("absent.sock"))),
        Duration::from_millis(100),
    );
    let mut frontend = Frontend::new(sessions, |_: &WorkUnit| Reply::ok("unreachable"));

    let reply = frontend.handle(request(Some("session=abc"))).unwrap();
    assert_eq!(reply.status, 500);
    assert_eq!(reply.body, UPSTREAM_UNAVAILABLE.as_bytes());
}
