//! Token and reservation collaborators
//!
//! The control handler only depends on these traits. Persistent backends
//! live outside this crate; [`MemoryStore`] backs the standalone binary and
//! tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

/// Opaque identity of an authtoken; zero or less means "unset"
pub type TokenId = i64;

/// Errors from token and reservation backends
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("already reserved")]
    AlreadyReserved,

    #[error("store error: {0}")]
    Backend(String),
}

/// Decides whether an authtoken may open tunnels
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<bool, StoreError>;
}

/// Maps an authtoken to its identity
#[async_trait]
pub trait TokenResolver: Send + Sync {
    /// `Ok(None)` when the token has no identity
    async fn token_id(&self, token: &str) -> Result<Option<TokenId>, StoreError>;
}

/// Exclusive bindings of subdomains and TCP ports to tokens
///
/// `reserve_*` must fail with [`StoreError::AlreadyReserved`] when another
/// owner holds the name; callers re-check ownership after any failure.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn reserved_subdomain_token_id(&self, name: &str) -> Result<Option<TokenId>, StoreError>;

    async fn reserve_subdomain(&self, token_id: TokenId, name: &str) -> Result<(), StoreError>;

    async fn unreserve_subdomain(&self, name: &str) -> Result<(), StoreError>;

    async fn reserved_tcp_port_token_id(&self, port: u16) -> Result<Option<TokenId>, StoreError>;

    async fn reserve_tcp_port(&self, token_id: TokenId, port: u16) -> Result<(), StoreError>;

    async fn unreserve_tcp_port(&self, port: u16) -> Result<(), StoreError>;
}

/// In-memory tokens and reservations
///
/// Reservations are insert-if-absent under a lock, so two concurrent first
/// claims cannot both succeed.
#[derive(Default)]
pub struct MemoryStore {
    tokens: RwLock<HashMap<String, TokenId>>,
    subdomains: Mutex<HashMap<String, TokenId>>,
    ports: Mutex<HashMap<u16, TokenId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a valid authtoken with its identity
    pub fn add_token(&self, token: impl Into<String>, id: TokenId) {
        self.tokens.write().insert(token.into(), id);
    }

    pub fn revoke_token(&self, token: &str) {
        self.tokens.write().remove(token);
    }

    pub fn token_count(&self) -> usize {
        self.tokens.read().len()
    }

    /// Pre-assign a subdomain, replacing any previous owner
    pub fn seed_subdomain(&self, token_id: TokenId, name: &str) {
        self.subdomains.lock().insert(normalize_name(name), token_id);
    }

    /// Pre-assign a TCP port, replacing any previous owner
    pub fn seed_tcp_port(&self, token_id: TokenId, port: u16) {
        self.ports.lock().insert(port, token_id);
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

#[async_trait]
impl TokenValidator for MemoryStore {
    async fn validate_token(&self, token: &str) -> Result<bool, StoreError> {
        Ok(self.tokens.read().contains_key(token.trim()))
    }
}

#[async_trait]
impl TokenResolver for MemoryStore {
    async fn token_id(&self, token: &str) -> Result<Option<TokenId>, StoreError> {
        Ok(self.tokens.read().get(token.trim()).copied())
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn reserved_subdomain_token_id(&self, name: &str) -> Result<Option<TokenId>, StoreError> {
        Ok(self.subdomains.lock().get(&normalize_name(name)).copied())
    }

    async fn reserve_subdomain(&self, token_id: TokenId, name: &str) -> Result<(), StoreError> {
        let mut subdomains = self.subdomains.lock();
        let name = normalize_name(name);
        match subdomains.get(&name) {
            Some(owner) if *owner == token_id => Ok(()),
            Some(_) => Err(StoreError::AlreadyReserved),
            None => {
                subdomains.insert(name, token_id);
                Ok(())
            }
        }
    }

    async fn unreserve_subdomain(&self, name: &str) -> Result<(), StoreError> {
        self.subdomains.lock().remove(&normalize_name(name));
        Ok(())
    }

    async fn reserved_tcp_port_token_id(&self, port: u16) -> Result<Option<TokenId>, StoreError> {
        Ok(self.ports.lock().get(&port).copied())
    }

    async fn reserve_tcp_port(&self, token_id: TokenId, port: u16) -> Result<(), StoreError> {
        let mut ports = self.ports.lock();
        match ports.get(&port) {
            Some(owner) if *owner == token_id => Ok(()),
            Some(_) => Err(StoreError::AlreadyReserved),
            None => {
                ports.insert(port, token_id);
                Ok(())
            }
        }
    }

    async fn unreserve_tcp_port(&self, port: u16) -> Result<(), StoreError> {
        self.ports.lock().remove(&port);
        Ok(())
    }
}
