use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use sluice_common::{MuxSession, TunnelError};

use crate::policy::AccessPolicy;

/// Length of generated tunnel ids
pub const TUNNEL_ID_LEN: usize = 8;

/// Candidates tried by [`TunnelRegistry::allocate_id`] before giving up
const ALLOCATE_ATTEMPTS: usize = 10;

/// Lowercase RFC 4648 base32 alphabet
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Byte stream toward a tunnel client
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// Anything that can open a fresh stream toward a tunnel client
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open_stream(&self) -> Result<BoxedStream, TunnelError>;
}

#[async_trait]
impl StreamOpener for MuxSession {
    async fn open_stream(&self) -> Result<BoxedStream, TunnelError> {
        let stream = MuxSession::open_stream(self).await?;
        Ok(Box::new(stream))
    }
}

/// A live HTTP tunnel, as seen by the data plane
pub struct HttpTunnelEntry {
    pub id: String,
    pub session: Arc<dyn StreamOpener>,
    pub policy: AccessPolicy,
}

impl std::fmt::Debug for HttpTunnelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTunnelEntry")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Errors from registry operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tunnel id is empty")]
    EmptyId,

    #[error("tunnel id already exists")]
    AlreadyExists,

    #[error("failed to allocate a unique id")]
    IdExhausted,
}

/// Active HTTP tunnels keyed by lowercase id
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<HttpTunnelEntry>>>,
}

impl TunnelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tunnels: RwLock::new(HashMap::new()),
        })
    }

    /// Insert a tunnel; never replaces an existing id
    pub fn register(&self, entry: HttpTunnelEntry) -> Result<Arc<HttpTunnelEntry>, RegistryError> {
        let id = normalize_id(&entry.id).ok_or(RegistryError::EmptyId)?;
        let entry = Arc::new(HttpTunnelEntry { id: id.clone(), ..entry });

        let mut tunnels = self.tunnels.write();
        if tunnels.contains_key(&id) {
            return Err(RegistryError::AlreadyExists);
        }
        tunnels.insert(id, entry.clone());
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<HttpTunnelEntry>> {
        let id = normalize_id(id)?;
        self.tunnels.read().get(&id).cloned()
    }

    /// Remove a tunnel; missing ids are ignored
    pub fn unregister(&self, id: &str) {
        if let Some(id) = normalize_id(id) {
            self.tunnels.write().remove(&id);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tunnels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick a random id not currently registered
    ///
    /// Only a read check is made per candidate; the later [`register`] call
    /// is what actually claims the id.
    ///
    /// [`register`]: TunnelRegistry::register
    pub fn allocate_id(&self) -> Result<String, RegistryError> {
        for _ in 0..ALLOCATE_ATTEMPTS {
            let candidate = generate_id();
            if !self.tunnels.read().contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(RegistryError::IdExhausted)
    }
}

fn normalize_id(id: &str) -> Option<String> {
    let id = id.trim().to_ascii_lowercase();
    (!id.is_empty()).then_some(id)
}

/// Generate an 8-character lowercase base32 id
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..TUNNEL_ID_LEN)
        .map(|_| BASE32_ALPHABET[rng.random_range(0..BASE32_ALPHABET.len())] as char)
        .collect()
}
