use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;

use crate::{
    domain::{ClientId, SessionBlob},
    errors::Error,
    store::{SessionStore, StoreBackend, StoredSession},
    utils::iso_timestamp_utc,
    Result,
};

/// Filesystem-backed session store: one JSON file per client id.
pub struct LocalStore {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl LocalStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, client_id: &ClientId) -> PathBuf {
        self.dir
            .join(format!("session-{}.json", file_safe(client_id.as_str())))
    }
}

#[async_trait]
impl SessionStore for LocalStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Local
    }

    async fn initialize(&self) -> Result<()> {
        if let Ok(md) = tokio::fs::metadata(&self.dir).await {
            if !md.is_dir() {
                return Err(Error::InvalidPath {
                    path: self.dir.clone(),
                    reason: "session directory path exists and is not a directory".to_string(),
                });
            }
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn save(&self, client_id: &ClientId, session: &SessionBlob) -> Result<()> {
        let record = StoredSession {
            client_id: client_id.0.clone(),
            session_data: session.clone(),
            updated_at: iso_timestamp_utc(),
        };
        let txt = serde_json::to_string(&record)?;

        // Write to a unique temp file then rename, so readers never see a partial file and
        // concurrent saves simply race to the last rename.
        let path = self.path_for(client_id);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.{seq}.tmp", std::process::id()));
        tokio::fs::write(&tmp, txt).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Io(e));
        }

        tracing::debug!(path = %path.display(), "session saved");
        Ok(())
    }

    async fn load(&self, client_id: &ClientId) -> Result<Option<SessionBlob>> {
        let path = self.path_for(client_id);
        let txt = match tokio::fs::read_to_string(&path).await {
            Ok(txt) => txt,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        if txt.trim().is_empty() {
            return Ok(None);
        }
        let record: StoredSession = serde_json::from_str(&txt)?;
        Ok(Some(record.session_data))
    }

    async fn delete(&self, client_id: &ClientId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(client_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
