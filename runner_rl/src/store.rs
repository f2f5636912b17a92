//! Named model persistence on top of sled.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::network::QNetwork;

/// Handle to the on-disk model database. Cheap to clone; every clone shares
/// the same sled instance, which may only be opened once per process.
#[derive(Clone)]
pub struct ModelStore {
    db: Arc<sled::Db>,
}

/// Keys are `<name>/online` and `<name>/target`, so a name may not contain
/// the separator.
fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(anyhow!("invalid model name '{name}'"));
    }
    Ok(())
}

fn online_key(name: &str) -> String {
    format!("{name}/online")
}

fn target_key(name: &str) -> String {
    format!("{name}/target")
}

impl ModelStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| anyhow!("Failed to open model store at '{}': {}", path.display(), e))?;
        info!("Model store opened at '{}'", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    /// In-memory store that is discarded on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("failed to open temporary model store")?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Write both networks under `name` atomically and flush.
    pub fn save_pair(&self, name: &str, online: &QNetwork, target: &QNetwork) -> Result<()> {
        check_name(name)?;
        let mut batch = sled::Batch::default();
        batch.insert(online_key(name).as_bytes(), bincode::serialize(online)?);
        batch.insert(target_key(name).as_bytes(), bincode::serialize(target)?);
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        debug!(model = name, "saved online and target networks");
        Ok(())
    }

    /// `Ok(None)` when either half of the pair is missing.
    pub fn load_pair(&self, name: &str) -> Result<Option<(QNetwork, QNetwork)>> {
        check_name(name)?;
        let online = self.db.get(online_key(name).as_bytes())?;
        let target = self.db.get(target_key(name).as_bytes())?;
        match (online, target) {
            (Some(online), Some(target)) => {
                let online: QNetwork = bincode::deserialize(&online)
                    .with_context(|| format!("corrupt online network for '{name}'"))?;
                let target: QNetwork = bincode::deserialize(&target)
                    .with_context(|| format!("corrupt target network for '{name}'"))?;
                Ok(Some((online, target)))
            }
            _ => Ok(None),
        }
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.db.contains_key(online_key(name).as_bytes())?
            && self.db.contains_key(target_key(name).as_bytes())?)
    }

    /// Test hook for corrupting one half of a saved pair.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.db.insert(key.as_bytes(), bytes)?;
        Ok(())
    }
}
