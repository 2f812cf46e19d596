//! Credential store
//!
//! Holds the current credential as an atomically swapped snapshot: readers
//! never block and never see a half-written credential. When backed by a
//! directory, every accepted credential is also written to
//! `<prefix>-<timestamp>.pem` and `<prefix>-current.pem` is re-pointed at it,
//! so a restarted process can reuse a still-valid certificate.

use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::credential::{Credential, CredentialSource};
use crate::{PkiError, Result};

/// Directory holding a component's persisted credentials
pub fn default_store_dir(component: &str) -> PathBuf {
    PathBuf::from(format!("/var/lib/{}/pki", component))
}

/// Current credential, optionally persisted to disk
pub struct CredentialStore {
    dir: Option<PathBuf>,
    prefix: String,
    current: ArcSwapOption<Credential>,
}

impl CredentialStore {
    /// Store that lives only in memory
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self {
            dir: None,
            prefix: prefix.into(),
            current: ArcSwapOption::empty(),
        }
    }

    /// Store persisted under `dir`
    ///
    /// Creates the directory if needed and loads `<prefix>-current.pem` when
    /// it holds a credential that is still valid.
    pub fn open(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| PkiError::store(&dir, e))?;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| PkiError::store(&dir, e))?;

        let store = Self {
            dir: Some(dir),
            prefix: prefix.into(),
            current: ArcSwapOption::empty(),
        };
        if let Some(cred) = store.load_persisted() {
            info!(
                path = %store.current_path().map(|p| p.display().to_string()).unwrap_or_default(),
                not_after = %cred.not_after(),
                "Loaded persisted credential"
            );
            store.current.store(Some(Arc::new(cred)));
        }
        Ok(store)
    }

    /// Path of the `current` link, when persisted
    pub fn current_path(&self) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-current.pem", self.prefix)))
    }

    fn load_persisted(&self) -> Option<Credential> {
        let path = self.current_path()?;
        let bundle = match std::fs::read_to_string(&path) {
            Ok(bundle) => zeroize::Zeroizing::new(bundle),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read persisted credential");
                return None;
            }
        };
        match Credential::from_bundle(&bundle) {
            Ok(cred) if cred.is_valid_at(Utc::now()) => Some(cred),
            Ok(cred) => {
                debug!(path = %path.display(), not_after = %cred.not_after(), "Persisted credential expired");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable persisted credential");
                None
            }
        }
    }

    /// Accept `cred` as the current credential
    ///
    /// The credential is persisted first; if that fails the previous
    /// credential stays current.
    pub fn update(&self, cred: Credential) -> Result<Arc<Credential>> {
        if let Some(dir) = &self.dir {
            self.persist(dir, &cred)?;
        }
        let cred = Arc::new(cred);
        self.current.store(Some(Arc::clone(&cred)));
        Ok(cred)
    }

    fn persist(&self, dir: &Path, cred: &Credential) -> Result<()> {
        let stamp = Utc::now().format("%Y-%m-%d-%H-%M-%S%.f");
        let file_name = format!("{}-{}.pem", self.prefix, stamp);
        let path = dir.join(&file_name);

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| PkiError::store(&path, e))?;
        file.write_all(cred.to_bundle().as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| PkiError::store(&path, e))?;

        // Swap the link atomically: build it under a temporary name, then rename
        let link = dir.join(format!("{}-current.pem", self.prefix));
        let tmp_link = dir.join(format!(".{}-current.pem.tmp", self.prefix));
        match std::fs::remove_file(&tmp_link) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PkiError::store(&tmp_link, e)),
        }
        std::os::unix::fs::symlink(&file_name, &tmp_link)
            .map_err(|e| PkiError::store(&tmp_link, e))?;
        std::fs::rename(&tmp_link, &link).map_err(|e| PkiError::store(&link, e))?;

        debug!(path = %path.display(), "Persisted credential");
        Ok(())
    }
}

impl CredentialSource for CredentialStore {
    fn current(&self) -> Option<Arc<Credential>> {
        self.current.load_full()
    }
}
