//! Follow cursors
//!
//! Where each follow relationship stopped, persisted as reserved keys in the
//! shard's own local store: `_ringkv.follow.<source admin address>.<shard>`
//! holding a bincode `LogPosition`.

use crate::binlog::LogPosition;
use crate::common::{Error, LocalStore, Result, RESERVED_PREFIX};
use std::sync::Arc;

const FOLLOW_PREFIX: &str = "follow.";

/// Identity of one follow source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorKey {
    pub source_admin_address: String,
    pub shard_id: u32,
}

impl CursorKey {
    pub fn new(source_admin_address: impl Into<String>, shard_id: u32) -> Self {
        Self {
            source_admin_address: source_admin_address.into(),
            shard_id,
        }
    }

    fn to_key(&self) -> Vec<u8> {
        let mut key = RESERVED_PREFIX.to_vec();
        key.extend_from_slice(
            format!("{}{}.{}", FOLLOW_PREFIX, self.source_admin_address, self.shard_id).as_bytes(),
        );
        key
    }

    fn from_key(key: &[u8]) -> Option<Self> {
        let rest = key.strip_prefix(RESERVED_PREFIX)?;
        let rest = std::str::from_utf8(rest).ok()?.strip_prefix(FOLLOW_PREFIX)?;
        let (address, shard) = rest.rsplit_once('.')?;
        Some(Self::new(address, shard.parse().ok()?))
    }
}

impl std::fmt::Display for CursorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.source_admin_address, self.shard_id)
    }
}

#[derive(Clone)]
pub struct ProgressStore {
    store: Arc<dyn LocalStore>,
}

impl ProgressStore {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, key: &CursorKey) -> Result<Option<LogPosition>> {
        match self.store.get(&key.to_key())? {
            Some(bytes) => {
                let position: LogPosition = bincode::deserialize(&bytes)
                    .map_err(|e| Error::Codec(format!("cursor {}: {}", key, e)))?;
                Ok(Some(position))
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, key: &CursorKey, position: LogPosition) -> Result<()> {
        let value = bincode::serialize(&position)
            .map_err(|e| Error::Internal(format!("serialize cursor {}: {}", key, e)))?;
        self.store.put(&key.to_key(), value)?;
        tracing::debug!("saved cursor {} at {}", key, position);
        Ok(())
    }

    pub fn clear(&self, key: &CursorKey) -> Result<()> {
        self.store.delete(&key.to_key())
    }

    /// Every saved cursor
    pub fn list(&self) -> Result<Vec<(CursorKey, LogPosition)>> {
        let mut prefix = RESERVED_PREFIX.to_vec();
        prefix.extend_from_slice(FOLLOW_PREFIX.as_bytes());

        let mut cursors = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = self.store.prefix_scan(&prefix, after.as_deref(), 256)?;
            let Some((last, _)) = page.last() else { break };
            after = Some(last.clone());
            for (key, value) in page {
                let Some(cursor) = CursorKey::from_key(&key) else {
                    continue;
                };
                let position: LogPosition = bincode::deserialize(&value)
                    .map_err(|e| Error::Codec(format!("cursor {}: {}", cursor, e)))?;
                cursors.push((cursor, position));
            }
        }
        Ok(cursors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemStore;

    #[test]
    fn test_save_load_clear() {
        let progress = ProgressStore::new(Arc::new(MemStore::new()));
        let key = CursorKey::new("10.0.0.1:8278", 3);
        assert_eq!(progress.load(&key).unwrap(), None);

        progress.save(&key, LogPosition::new(2, 4096)).unwrap();
        assert_eq!(progress.load(&key).unwrap(), Some(LogPosition::new(2, 4096)));

        progress.clear(&key).unwrap();
        assert_eq!(progress.load(&key).unwrap(), None);
    }

    #[test]
    fn test_cursor_keys_are_reserved_and_listed() {
        let store: Arc<dyn LocalStore> = Arc::new(MemStore::new());
        let progress = ProgressStore::new(store.clone());
        let a = CursorKey::new("10.0.0.1:8278", 0);
        let b = CursorKey::new("10.0.0.2:8278", 12);
        progress.save(&a, LogPosition::new(0, 10)).unwrap();
        progress.save(&b, LogPosition::new(1, 20)).unwrap();
        store.put(b"user:1", b"not a cursor".to_vec()).unwrap();

        assert!(crate::common::is_reserved_key(&a.to_key()));
        let mut listed = progress.list().unwrap();
        listed.sort();
        assert_eq!(
            listed,
            vec![(a, LogPosition::new(0, 10)), (b, LogPosition::new(1, 20))]
        );
    }
}
