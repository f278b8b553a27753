// SPDX-License-Identifier: MIT OR Apache-2.0

//! File provider: the on-disk config cache.
//!
//! The cache file holds one config document, identical to what the HTTP
//! streaming endpoint serves, with no delimiter. It is read once at
//! bootstrap for a fast start and (unless opened read-only) rewritten
//! atomically every time a new config is accepted.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::HostEntry;
use crate::confmon::{Provider, ProviderKind};
use crate::error::{CouchError, Result};
use crate::topology::{ClusterConfig, ConfigOrigin, SharedConfig};

pub struct FileProvider {
    path: PathBuf,
    read_only: bool,
    cached: Mutex<Option<SharedConfig>>,
    /// The cache is consumed once; later refresh calls defer to live
    /// providers.
    consumed: Mutex<bool>,
}

impl FileProvider {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            read_only,
            cached: Mutex::new(None),
            consumed: Mutex::new(false),
        })
    }

    fn write_atomically(&self, raw: &[u8]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)
            .map_err(|e| CouchError::Internal(format!("config cache write: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| CouchError::Internal(format!("config cache rename: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::File
    }

    async fn refresh(&self) -> Result<SharedConfig> {
        {
            let mut consumed = self.consumed.lock().expect("file provider lock");
            if *consumed {
                return Err(CouchError::KeyNotFound);
            }
            *consumed = true;
        }

        let raw = std::fs::read(&self.path)
            .map_err(|e| CouchError::InvalidArgument(format!("config cache read: {e}")))?;
        // Cached documents carry concrete hostnames; no placeholder origin.
        let config = Arc::new(ClusterConfig::parse(&raw, "localhost", ConfigOrigin::File)?);
        debug!(path = %self.path.display(), rev = ?config.rev, "loaded config cache");
        *self.cached.lock().expect("file provider lock") = Some(Arc::clone(&config));
        Ok(config)
    }

    fn get_cached(&self) -> Option<SharedConfig> {
        self.cached.lock().expect("file provider lock").clone()
    }

    fn config_updated(&self, config: &SharedConfig) {
        *self.cached.lock().expect("file provider lock") = Some(Arc::clone(config));
        if self.read_only || config.raw.is_empty() {
            return;
        }
        if let Err(err) = self.write_atomically(&config.raw) {
            warn!(path = %self.path.display(), %err, "failed to persist config cache");
        }
    }

    fn configure_nodes(&self, _nodes: &[HostEntry]) {}

    fn get_nodes(&self) -> Vec<HostEntry> {
        Vec::new()
    }

    fn dump(&self, out: &mut String) {
        out.push_str(&format!(
            "file: path={} ro={} cached={}\n",
            self.path.display(),
            self.read_only,
            self.cached.lock().expect("file provider lock").is_some()
        ));
    }
}
