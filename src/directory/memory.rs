//! In-process directory, used in standalone mode and by tests.
//!
//! Clones share the same buckets, so several simulated peers can be
//! pointed at one store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::DirectoryStore;
use crate::error::{GlueError, Result};
use crate::types::UnitId;

#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    buckets: Arc<RwLock<HashMap<UnitId, HashMap<String, String>>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self {
            buckets: Arc::default(),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the store becoming unreachable.
    #[cfg(test)]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GlueError::directory("memory directory offline"))
        }
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn put(&self, owner: &UnitId, key: &str, value: &str) -> Result<()> {
        self.check()?;
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(owner.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, unit: &UnitId, key: &str) -> Result<Option<String>> {
        self.check()?;
        let buckets = self.buckets.read().await;
        Ok(buckets.get(unit).and_then(|b| b.get(key)).cloned())
    }

    async fn members(&self) -> Result<Vec<UnitId>> {
        self.check()?;
        let buckets = self.buckets.read().await;
        Ok(buckets.keys().cloned().collect())
    }

    async fn depart(&self, owner: &UnitId) -> Result<()> {
        self.check()?;
        self.buckets.write().await.remove(owner);
        Ok(())
    }
}
