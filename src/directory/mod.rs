//! Peer address discovery.
//!
//! Every peer owns one bucket in a shared key/value store and writes its
//! reachable address under [`ADDRESS_KEY`].  Peers only ever write their
//! own bucket and read everybody else's, so no coordination between
//! writers is needed.  The store is eventually consistent: a peer that
//! has not published yet is simply missing from the result, and the next
//! membership trigger picks it up.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use log::debug;

use crate::error::Result;
use crate::types::{PeerAddress, UnitId};

pub mod file;
pub mod memory;

pub use file::FileDirectory;
pub use memory::MemoryDirectory;

/// Key under which each peer publishes its address.
pub const ADDRESS_KEY: &str = "ingress-address";

/// A store of per-peer buckets, readable by all peers.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Upserts `key` in the bucket owned by `owner`.
    async fn put(&self, owner: &UnitId, key: &str, value: &str) -> Result<()>;

    /// Reads `key` from `unit`'s bucket.
    async fn get(&self, unit: &UnitId, key: &str) -> Result<Option<String>>;

    /// Lists the peers that currently own a bucket.
    async fn members(&self) -> Result<Vec<UnitId>>;

    /// Drops the bucket owned by `owner`.  Missing buckets are not an error.
    async fn depart(&self, owner: &UnitId) -> Result<()>;
}

/// This peer's view of the shared address directory.
///
/// The identity and address are fixed at construction, which is what
/// keeps a peer from ever writing into somebody else's bucket.
#[derive(Clone)]
pub struct AddressDirectory {
    unit: UnitId,
    address: PeerAddress,
    store: Arc<dyn DirectoryStore>,
}

impl AddressDirectory {
    pub fn new(unit: UnitId, address: PeerAddress, store: Arc<dyn DirectoryStore>) -> Self {
        Self {
            unit,
            address,
            store,
        }
    }

    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    pub fn own_address(&self) -> &PeerAddress {
        &self.address
    }

    /// Publishes this peer's address.  Safe to call on every pass.
    pub async fn publish_self_address(&self) -> Result<()> {
        self.store
            .put(&self.unit, ADDRESS_KEY, self.address.as_str())
            .await?;
        debug!("Published {} -> {}", self.unit, self.address);
        Ok(())
    }

    /// Returns the addresses of every peer that has published one.
    ///
    /// The local address is always included, taken from memory rather
    /// than read back from the store.
    pub async fn list_all_addresses(&self) -> Result<BTreeSet<PeerAddress>> {
        let peers: Vec<UnitId> = self
            .store
            .members()
            .await?
            .into_iter()
            .filter(|unit| *unit != self.unit)
            .collect();

        let published = try_join_all(
            peers
                .iter()
                .map(|unit| self.store.get(unit, ADDRESS_KEY)),
        )
        .await?;

        let mut result = BTreeSet::new();
        result.insert(self.address.clone());
        for (unit, raw) in peers.iter().zip(published) {
            match raw.as_deref().and_then(PeerAddress::parse) {
                Some(address) => {
                    result.insert(address);
                }
                None => debug!("Peer {} has not published an address yet", unit),
            }
        }

        debug!(
            "All peer addresses: {}",
            result
                .iter()
                .map(PeerAddress::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(result)
    }

    /// Removes this peer's entry, e.g. on shutdown.
    pub async fn depart(&self) -> Result<()> {
        self.store.depart(&self.unit).await
    }
}
