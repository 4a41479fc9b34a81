//! Session persistence.
//!
//! Two backends implement [`SessionStore`]: [`LocalStore`] (files on disk) and
//! [`RemoteStore`] (Supabase over its REST API). The backend is chosen once at startup by
//! [`from_config`] and injected; nothing re-checks the environment per call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    domain::{ClientId, SessionBlob},
    Result,
};

pub mod local;
pub mod remote;

pub use local::LocalStore;
pub use remote::RemoteStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Local,
    Remote,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreBackend::Local => "local",
            StoreBackend::Remote => "remote",
        }
    }
}

/// Persisted record, same shape for every backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredSession {
    pub client_id: String,
    pub session_data: SessionBlob,
    pub updated_at: String,
}

/// Persists one opaque session blob per client id.
///
/// Writes are last-write-wins upserts. Overlapping `save` calls for the same id are safe
/// but unordered.
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn backend(&self) -> StoreBackend;

    /// Establish connectivity and provision storage. Idempotent.
    async fn initialize(&self) -> Result<()>;

    async fn save(&self, client_id: &ClientId, session: &SessionBlob) -> Result<()>;

    /// `Ok(None)` when nothing was ever saved for `client_id`; `Err` only for real
    /// storage/transport failures.
    async fn load(&self, client_id: &ClientId) -> Result<Option<SessionBlob>>;

    /// Remove the record. Deleting an unknown id is not an error.
    async fn delete(&self, client_id: &ClientId) -> Result<()>;
}

/// Remote storage when Supabase credentials are configured, local files otherwise.
pub fn from_config(cfg: &Config) -> Result<Arc<dyn SessionStore>> {
    match &cfg.supabase {
        Some(supabase) => Ok(Arc::new(RemoteStore::new(
            &supabase.url,
            &supabase.anon_key,
        )?)),
        None => Ok(Arc::new(LocalStore::new(cfg.session_dir.clone()))),
    }
}

/// Result of bringing a store online at startup.
pub struct OpenedStore {
    /// `None` when the backend could not be initialized; the process then keeps its
    /// session in memory only.
    pub store: Option<Arc<dyn SessionStore>>,
    pub session: Option<SessionBlob>,
}

/// Initialize `store` and load the saved session for `client_id`.
///
/// Never fails: storage problems degrade to "no persisted session".
pub async fn open(store: Arc<dyn SessionStore>, client_id: &ClientId) -> OpenedStore {
    let backend = store.backend().as_str();

    if let Err(e) = store.initialize().await {
        tracing::warn!(
            backend,
            error = %e,
            "session store unavailable; continuing without persisted session"
        );
        return OpenedStore {
            store: None,
            session: None,
        };
    }

    let session = match store.load(client_id).await {
        Ok(Some(session)) => {
            tracing::info!(backend, %client_id, "loaded saved session");
            Some(session)
        }
        Ok(None) => {
            tracing::info!(backend, %client_id, "no saved session; pairing will be required");
            None
        }
        Err(e) => {
            tracing::warn!(backend, %client_id, error = %e, "failed to load saved session");
            None
        }
    };

    OpenedStore {
        store: Some(store),
        session,
    }
}
