//! Session validation delegated to a peer authority.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Connector, PeerCallGateway};
use crate::errors::VigilError;

/// Message shown for every failed login, whatever the cause.
pub const INVALID_CREDENTIALS: &str = "Invalid username or password.";

/// Reply of the session authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionVerdict {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

/// What the front end should do with a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// Not authenticated; send the user to this login URL.
    Redirect(String),
    /// The authority refused without saying where to go.
    Denied,
    /// The authority did not answer in time or answered garbage.
    UpstreamUnavailable,
}

/// Front-end side: asks the authority about a session token.
pub struct SessionClient<C: Connector> {
    gateway: PeerCallGateway<C>,
    timeout: Duration,
}

impl<C: Connector> SessionClient<C> {
    pub fn new(gateway: PeerCallGateway<C>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    /// Validate `token`, which may be empty when the request had no cookie.
    pub fn check(&mut self, token: &str) -> AccessDecision {
        let reply = match self.gateway.call(token.as_bytes(), self.timeout) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "session authority unavailable");
                return AccessDecision::UpstreamUnavailable;
            }
        };

        match serde_json::from_slice::<SessionVerdict>(&reply) {
            Ok(SessionVerdict { success: true, .. }) => AccessDecision::Allow,
            Ok(SessionVerdict {
                redirect: Some(url),
                ..
            }) => AccessDecision::Redirect(url),
            Ok(_) => AccessDecision::Denied,
            Err(e) => {
                warn!(error = %e, "malformed session verdict");
                AccessDecision::UpstreamUnavailable
            }
        }
    }
}

/// A logged-in session as stored by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub began: DateTime<Utc>,
    pub user_id: String,
}

/// A user whose credentials checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
}

/// Session persistence, backed by whatever document store the deployment uses.
pub trait SessionStore: Send {
    fn find_session(&self, key: &str) -> crate::errors::Result<Option<Session>>;
    fn insert_session(&mut self, session: Session) -> crate::errors::Result<()>;
}

/// Checks a username and password. Hashing and user storage live behind it.
pub trait CredentialVerifier {
    fn verify(&self, username: &str, password: &str) -> crate::errors::Result<Option<UserRecord>>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: HashMap<String, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn find_session(&self, key: &str) -> crate::errors::Result<Option<Session>> {
        Ok(self.sessions.get(key).cloned())
    }

    fn insert_session(&mut self, session: Session) -> crate::errors::Result<()> {
        self.sessions.insert(session.key.clone(), session);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("{}", INVALID_CREDENTIALS)]
    InvalidCredentials,
    #[error("session could not be stored: {0}")]
    Store(#[source] VigilError),
}

/// Peer side of session validation, plus the login flow that creates sessions.
pub struct SessionAuthority<S: SessionStore> {
    store: S,
    login_url: String,
}

impl<S: SessionStore> SessionAuthority<S> {
    pub fn new(store: S, login_url: impl Into<String>) -> Self {
        Self {
            store,
            login_url: login_url.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn validate(&self, token: &str) -> SessionVerdict {
        let found = if token.is_empty() {
            None
        } else {
            match self.store.find_session(token) {
                Ok(found) => found,
                Err(e) => {
                    warn!(code = e.code(), error = %e, "session lookup failed");
                    None
                }
            }
        };

        match found {
            Some(session) => {
                debug!(user = %session.user_id, "session valid");
                SessionVerdict {
                    success: true,
                    redirect: None,
                }
            }
            None => SessionVerdict {
                success: false,
                redirect: Some(self.login_url.clone()),
            },
        }
    }

    /// Answer one raw peer request: the token bytes in, a JSON verdict out.
    pub fn handle(&self, request: &[u8]) -> Vec<u8> {
        let token = String::from_utf8_lossy(request);
        let verdict = self.validate(token.trim());
        serde_json::to_vec(&verdict).unwrap_or_else(|_| br#"{"success":false}"#.to_vec())
    }

    /// Check credentials and open a session. Returns the new session key.
    pub fn login<V: CredentialVerifier>(
        &mut self,
        verifier: &V,
        username: &str,
        password: &str,
    ) -> Result<String, LoginError> {
        let user = match verifier.verify(username, password) {
            Ok(Some(user)) => user,
            Ok(None) => return Err(LoginError::InvalidCredentials),
            Err(e) => {
                warn!(code = e.code(), error = %e, "credential check failed");
                return Err(LoginError::InvalidCredentials);
            }
        };

        let began = Utc::now();
        let key = session_key(&user.id, began);
        self.store
            .insert_session(Session {
                key: key.clone(),
                began,
                user_id: user.id,
            })
            .map_err(LoginError::Store)?;
        Ok(key)
    }
}

/// Hex SHA-512 over random bytes, the start time and the user id.
fn session_key(user_id: &str, began: DateTime<Utc>) -> String {
    let mut salt = [0u8; 32];
    rand::rng().fill_bytes(&mut salt);

    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(began.to_rfc3339().as_bytes());
    hasher.update(user_id.as_bytes());
    hex::encode(hasher.finalize())
}
