use serde::{Deserialize, Serialize};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{BUNDLES_STORE, NAMED_QUERIES_STORE};
use crate::firestore::model::SnapshotVersion;

/// Header of a loaded data bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub id: String,
    pub version: i32,
    pub create_time: SnapshotVersion,
    pub total_documents: u32,
    pub total_bytes: u64,
}

/// A query shipped inside a bundle, with the read time its results were captured at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

/// Persists bundle headers and named queries so a bundle is not applied twice.
#[derive(Clone, Copy, Debug, Default)]
pub struct BundleCache;

impl BundleCache {
    pub fn new() -> Self {
        Self
    }

    pub fn get_bundle_metadata(
        &self,
        txn: &PersistenceTransaction<'_>,
        bundle_id: &str,
    ) -> FirestoreResult<Option<BundleMetadata>> {
        txn.get(BUNDLES_STORE, bundle_id)
    }

    pub fn save_bundle_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        metadata: &BundleMetadata,
    ) -> FirestoreResult<()> {
        txn.put(BUNDLES_STORE, metadata.id.clone(), metadata)
    }

    pub fn get_named_query(&self, txn: &PersistenceTransaction<'_>, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        txn.get(NAMED_QUERIES_STORE, name)
    }

    pub fn save_named_query(&self, txn: &mut PersistenceTransaction<'_>, query: &NamedQuery) -> FirestoreResult<()> {
        txn.put(NAMED_QUERIES_STORE, query.name.clone(), query)
    }
}
