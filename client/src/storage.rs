//! Persisted auth state.
//!
//! The session manager persists a projection of its state under a single
//! storage key so a restart can rehydrate it before the backend is asked.
//! The on-disk shape is a versioned envelope:
//!
//! ```json
//! { "state": { "isAuthenticated": true, "user": {...}, ... }, "version": 0 }
//! ```
//!
//! Role flags are stored for inspection only; the manager recomputes them
//! from the stored session on load.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Session, User};

/// Storage key of the persisted auth state.
pub const STORAGE_KEY: &str = "auth-storage";

/// Envelope version written by this crate.
const STORAGE_VERSION: u32 = 0;

/// Errors from reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stored document is not valid JSON of the expected shape.
    #[error("stored auth state is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// The persisted projection of the auth state. Never holds a password.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedAuth {
    pub is_authenticated: bool,
    pub user: Option<User>,
    pub session: Option<Session>,
    pub is_admin: bool,
    pub is_user: bool,
    /// Session expiry as epoch seconds.
    pub session_expiration: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    state: PersistedAuth,
    version: u32,
}

/// Key-value persistence for the auth state.
pub trait AuthStorage: Send + Sync {
    /// Loads the stored state, or `None` if nothing usable is stored.
    fn load(&self) -> Result<Option<PersistedAuth>, StorageError>;

    /// Replaces the stored state.
    fn save(&self, state: &PersistedAuth) -> Result<(), StorageError>;

    /// Removes the stored state.
    fn clear(&self) -> Result<(), StorageError>;
}

fn decode(contents: &str) -> Result<Option<PersistedAuth>, StorageError> {
    let envelope: Envelope = serde_json::from_str(contents)?;
    if envelope.version != STORAGE_VERSION {
        warn!(version = envelope.version, "Ignoring auth state with unknown version");
        return Ok(None);
    }
    Ok(Some(envelope.state))
}

fn encode(state: &PersistedAuth) -> Result<String, StorageError> {
    Ok(serde_json::to_string_pretty(&Envelope {
        state: state.clone(),
        version: STORAGE_VERSION,
    })?)
}

/// Stores the auth state as `<dir>/auth-storage.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Creates a storage rooted at `dir`. The directory is created on the
    /// first save.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{STORAGE_KEY}.json")),
        }
    }

    /// Returns the path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuthStorage for FileStorage {
    fn load(&self) -> Result<Option<PersistedAuth>, StorageError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode(&contents)
    }

    /// Writes to a temporary file and renames it over the target, so a
    /// crash mid-write leaves the previous state intact.
    fn save(&self, state: &PersistedAuth) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;

            // Owner read/write only; the file holds tokens.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = file.metadata()?.permissions();
                perms.set_mode(0o600);
                fs::set_permissions(&tmp_path, perms)?;
            }

            file.write_all(encode(state)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), "Auth state saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory storage holding the encoded document.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    contents: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a storage preloaded with `state`.
    pub fn with_state(state: &PersistedAuth) -> Result<Self, StorageError> {
        Ok(Self {
            contents: Mutex::new(Some(encode(state)?)),
        })
    }

    /// Creates a storage preloaded with a raw document.
    pub fn with_raw(contents: impl Into<String>) -> Self {
        Self {
            contents: Mutex::new(Some(contents.into())),
        }
    }

    /// Returns the raw stored document.
    pub fn raw(&self) -> Option<String> {
        self.contents.lock().clone()
    }
}

impl AuthStorage for MemoryStorage {
    fn load(&self) -> Result<Option<PersistedAuth>, StorageError> {
        match self.contents.lock().as_deref() {
            Some(contents) => decode(contents),
            None => Ok(None),
        }
    }

    fn save(&self, state: &PersistedAuth) -> Result<(), StorageError> {
        *self.contents.lock() = Some(encode(state)?);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.contents.lock() = None;
        Ok(())
    }
}
