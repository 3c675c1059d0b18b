//! Shared state for the HTTP layer: the database handle, the clock, the
//! SMS transport and the in-memory session store. Tokens are random
//! 256-bit values; only their SHA-256 hash is kept server-side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::calendar::Clock;
use crate::sms::provider::SmsTransport;
use crate::users::User;

/// Shared context handed to middleware (via `Extension`) and handlers
/// (via `State`). Cheap to clone.
#[derive(Clone)]
pub struct ApiContext {
    pub db: Arc<Mutex<Connection>>,
    pub clock: Clock,
    pub transport: Arc<SmsTransport>,
    pub sessions: Arc<Mutex<SessionStore>>,
}

impl ApiContext {
    pub fn new(conn: Connection, clock: Clock, transport: SmsTransport) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            clock,
            transport: Arc::new(transport),
            sessions: Arc::new(Mutex::new(SessionStore::default())),
        }
    }
}

/// The authenticated caller, injected into request extensions by the
/// auth middleware.
#[derive(Clone)]
pub struct AuthUser(pub User);

/// Generate a new random bearer token (256 bits, URL-safe base64).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a token for storage and lookup.
pub fn hash_token(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Token-hash → user id map. Sessions live for the process lifetime;
/// logging in again simply issues another token.
#[derive(Default)]
pub struct SessionStore {
    sessions: HashMap<[u8; 32], String>,
}

impl SessionStore {
    /// Issue a fresh token for the user and return it. The raw token is
    /// never stored.
    pub fn issue(&mut self, user_id: &str) -> String {
        let token = generate_token();
        self.sessions.insert(hash_token(&token), user_id.to_string());
        token
    }

    /// Resolve a presented token to a user id.
    pub fn resolve(&self, token: &str) -> Option<&str> {
        self.sessions.get(&hash_token(token)).map(String::as_str)
    }

    pub fn revoke(&mut self, token: &str) {
        self.sessions.remove(&hash_token(token));
    }
}
