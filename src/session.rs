//! Admin sessions, session cookies and password hashing

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "goule_session";

/// Largest timeout chrono can represent
const MAX_TIMEOUT_SECS: u64 = (i64::MAX / 1000) as u64;

#[derive(Debug, Clone)]
struct Session {
    authenticated: bool,
    last_used: DateTime<Utc>,
}

/// Issues, validates and invalidates session tokens.
///
/// Validity is checked without coordinating with a concurrent logout; a
/// request racing its own session's logout may go either way.
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    timeout_secs: AtomicU64,
}

impl SessionManager {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout_secs: AtomicU64::new(timeout_secs),
        }
    }

    pub fn set_timeout(&self, timeout_secs: u64) {
        self.timeout_secs.store(timeout_secs, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        let secs = self.timeout_secs.load(Ordering::Relaxed).min(MAX_TIMEOUT_SECS);
        Duration::seconds(secs as i64)
    }

    /// Create an authenticated session and return its token
    pub fn login(&self) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.insert(
            token.clone(),
            Session {
                authenticated: true,
                last_used: Utc::now(),
            },
        );
        debug!(sessions = self.sessions.len(), "Session created");
        token
    }

    /// Check a token, refreshing its expiry on success
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, Utc::now())
    }

    fn validate_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        let timeout = self.timeout();
        let expired = match self.sessions.get_mut(token) {
            Some(mut session) => {
                if now - session.last_used > timeout {
                    true
                } else {
                    session.last_used = now;
                    return session.authenticated;
                }
            }
            None => return false,
        };
        if expired {
            self.sessions.remove(token);
        }
        false
    }

    pub fn logout(&self, token: &str) {
        self.sessions.remove(token);
    }

    /// Drop every expired session
    pub fn purge_expired(&self) {
        let timeout = self.timeout();
        let now = Utc::now();
        self.sessions.retain(|_, s| now - s.last_used <= timeout);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// `Set-Cookie` value establishing a session
pub fn session_cookie(token: &str) -> String {
    format!("{}={}; Path=/; HttpOnly; SameSite=Strict", SESSION_COOKIE, token)
}

/// `Set-Cookie` value telling the client to discard its session cookie
pub fn logout_cookie() -> String {
    format!(
        "{}=deleted; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Strict",
        SESSION_COOKIE
    )
}

/// Extract the session token from a `Cookie` header value
pub fn token_from_cookie_header(cookie_header: &str) -> Option<String> {
    let prefix = format!("{}=", SESSION_COOKIE);
    for cookie in cookie_header.split(';') {
        if let Some(value) = cookie.trim().strip_prefix(&prefix) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Lowercase hex SHA-256 of a password
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

pub fn verify_password(password: &str, expected_hash: &str) -> bool {
    !expected_hash.is_empty() && hash_password(password) == expected_hash.to_lowercase()
}
