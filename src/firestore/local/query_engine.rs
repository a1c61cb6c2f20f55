use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};
use crate::firestore::settings::FirestoreSettings;

/// Counts the work done while answering one query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryContext {
    documents_read: usize,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_documents_read(&mut self, count: usize) {
        self.documents_read += count;
    }

    pub fn documents_read(&self) -> usize {
        self.documents_read
    }
}

/// How a query result was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    DocumentLookup,
    Index,
    PreviousResults,
    FullScan,
}

#[derive(Clone, Debug)]
pub(crate) struct QueryOutcome {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub strategy: QueryStrategy,
    pub context: QueryContext,
}

/// Picks the cheapest way to answer a query from the local cache.
///
/// Every strategy only narrows the candidate set; final filtering is always done in memory
/// against the local view, so results never depend on which path was taken.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    local_documents: LocalDocumentsView,
    index_manager: IndexManager,
    index_auto_creation_enabled: bool,
    index_auto_creation_min_collection_size: usize,
    relative_index_read_cost_per_document: f64,
}

impl QueryEngine {
    pub fn new(local_documents: LocalDocumentsView, index_manager: IndexManager) -> Self {
        Self {
            local_documents,
            index_manager,
            index_auto_creation_enabled: false,
            index_auto_creation_min_collection_size: 100,
            relative_index_read_cost_per_document: 2.0,
        }
    }

    pub fn with_settings(mut self, settings: &FirestoreSettings) -> Self {
        self.index_auto_creation_enabled = settings.index_auto_creation_enabled;
        self.index_auto_creation_min_collection_size = settings.index_auto_creation_min_collection_size;
        self.relative_index_read_cost_per_document = settings.relative_index_read_cost_per_document;
        self
    }

    pub fn local_documents(&self) -> &LocalDocumentsView {
        &self.local_documents
    }

    /// All documents in the local view matching `query`.
    ///
    /// `remote_keys` are the documents the server last reported for the query's target, and
    /// `last_limbo_free_snapshot` the last version at which that result had no limbo documents.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        Ok(self
            .run_query(txn, query, last_limbo_free_snapshot, remote_keys)?
            .documents)
    }

    pub(crate) fn run_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<QueryOutcome> {
        let mut context = QueryContext::new();

        if query.is_document_query() {
            let documents =
                self.local_documents
                    .get_documents_matching_query(txn, query, SnapshotVersion::min(), &mut context)?;
            return Ok(QueryOutcome {
                documents,
                strategy: QueryStrategy::DocumentLookup,
                context,
            });
        }

        if let Some(documents) = self.perform_query_using_index(txn, query, &mut context)? {
            return Ok(QueryOutcome {
                documents,
                strategy: QueryStrategy::Index,
                context,
            });
        }

        if let Some(documents) =
            self.perform_query_using_remote_keys(txn, query, remote_keys, last_limbo_free_snapshot, &mut context)?
        {
            return Ok(QueryOutcome {
                documents,
                strategy: QueryStrategy::PreviousResults,
                context,
            });
        }

        let documents =
            self.local_documents
                .get_documents_matching_query(txn, query, SnapshotVersion::min(), &mut context)?;
        if self.index_auto_creation_enabled {
            self.create_cache_indexes(txn, query, &context, documents.len())?;
        }
        Ok(QueryOutcome {
            documents,
            strategy: QueryStrategy::FullScan,
            context,
        })
    }

    fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &mut QueryContext,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        if query.matches_all_documents() {
            return Ok(None);
        }
        let Some(scan) = self.index_manager.get_documents_matching_target(txn, &query.to_target())? else {
            return Ok(None);
        };

        context.increment_documents_read(scan.keys.len());
        let mut results: BTreeMap<DocumentKey, Document> = self
            .local_documents
            .get_documents(txn, &scan.keys)?
            .into_iter()
            .filter(|(_, document)| query.matches(document))
            .collect();
        let remaining = self
            .local_documents
            .get_documents_matching_query(txn, query, scan.read_time, context)?;
        results.extend(remaining);
        log::trace!(
            "index {} answered query {} with {} documents",
            scan.index_id,
            query.canonical_id(),
            results.len()
        );
        Ok(Some(results))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot: SnapshotVersion,
        context: &mut QueryContext,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        if query.matches_all_documents() || last_limbo_free_snapshot.is_min() {
            return Ok(None);
        }

        context.increment_documents_read(remote_keys.len());
        let documents = self.local_documents.get_documents(txn, remote_keys)?;
        let mut previous: Vec<Document> = documents
            .into_values()
            .filter(|document| query.matches(document))
            .collect();
        previous.sort_by(|a, b| query.compare_documents(a, b));

        if needs_refill(query, &previous, remote_keys, last_limbo_free_snapshot) {
            log::trace!("previous results of {} need a refill", query.canonical_id());
            return Ok(None);
        }

        let mut results: BTreeMap<DocumentKey, Document> = previous
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();
        let changed = self
            .local_documents
            .get_documents_matching_query(txn, query, last_limbo_free_snapshot, context)?;
        results.extend(changed);
        Ok(Some(results))
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        let read = context.documents_read();
        if read < self.index_auto_creation_min_collection_size {
            return Ok(());
        }
        if read as f64 > self.relative_index_read_cost_per_document * result_size as f64 {
            let created = self.index_manager.create_target_indexes(txn, &query.to_target())?;
            if created > 0 {
                log::debug!(
                    "query {} read {} documents for {} results; requested {} indexes",
                    query.canonical_id(),
                    read,
                    result_size,
                    created
                );
            }
        }
        Ok(())
    }
}

/// Whether a limit query's previous result may have lost documents at its edge.
///
/// `sorted_previous` holds the previous matches in query order.
fn needs_refill(
    query: &Query,
    sorted_previous: &[Document],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    // A previously matching document was deleted or no longer matches.
    if remote_keys.len() != sorted_previous.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous.last(),
        LimitType::Last => sorted_previous.first(),
    };
    match edge {
        None => false,
        Some(document) => {
            document.has_unconfirmed_writes() || document.version() > limbo_free_snapshot
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::user::User;
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::index_manager::{IndexBackfiller, IndexKind};
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{MutableDocument, Mutation};
    use crate::firestore::test_support::{
        doc, field, filter, key, memory_persistence, order_by, patch_mutation, query, set_mutation, test_settings,
        version,
    };
    use serde_json::json;

    fn engine() -> QueryEngine {
        let user = User::unauthenticated();
        let view = LocalDocumentsView::new(
            RemoteDocumentCache::new(),
            MutationQueue::for_user(&user),
            DocumentOverlayCache::for_user(&user),
        );
        QueryEngine::new(view, IndexManager::new())
    }

    fn store(txn: &mut PersistenceTransaction<'_>, docs: Vec<MutableDocument>) -> FirestoreResult<()> {
        let mut buffer = RemoteDocumentCache::new().new_change_buffer();
        for mut document in docs {
            let read_time = document.version();
            document.set_read_time(read_time);
            buffer.add_entry(document);
        }
        buffer.apply(txn)
    }

    fn write_locally(txn: &mut PersistenceTransaction<'_>, batch_id: i32, mutation: Mutation) -> FirestoreResult<()> {
        let overlays: BTreeMap<DocumentKey, Mutation> = [(mutation.key().clone(), mutation)].into_iter().collect();
        DocumentOverlayCache::for_user(&User::unauthenticated()).save_overlays(txn, batch_id, &overlays)
    }

    fn keys(documents: &BTreeMap<DocumentKey, Document>) -> Vec<String> {
        documents.keys().map(|k| k.path().canonical_string()).collect()
    }

    fn seed(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        store(
            txn,
            vec![
                doc("rooms/a", 1, json!({"size": 1, "tags": ["x"]})),
                doc("rooms/b", 2, json!({"size": 5, "tags": ["x", "y"]})),
                doc("rooms/c", 3, json!({"size": 8})),
                doc("rooms/d", 4, json!({"size": "big"})),
                doc("lobby/e", 4, json!({"size": 5})),
            ],
        )?;
        write_locally(txn, 1, patch_mutation("rooms/a", json!({"size": 6})))?;
        write_locally(txn, 2, set_mutation("rooms/z", json!({"size": 7, "tags": ["y"]})))
    }

    #[tokio::test]
    async fn document_query_is_a_point_lookup() {
        let persistence = memory_persistence().await;
        let engine = engine();
        persistence
            .run_transaction("lookup", TransactionMode::ReadWrite, |txn| {
                seed(txn)?;
                let outcome = engine.run_query(txn, &query("rooms/z"), SnapshotVersion::min(), &BTreeSet::new())?;
                assert_eq!(outcome.strategy, QueryStrategy::DocumentLookup);
                assert_eq!(keys(&outcome.documents), vec!["rooms/z"]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn index_scan_matches_full_scan() {
        let persistence = memory_persistence().await;
        let engine = engine();
        let queries = vec![
            query("rooms").with_filter(filter("size", ">", json!(4))),
            query("rooms").with_filter(filter("size", "==", json!(5))),
            query("rooms").with_filter(filter("size", "in", json!([1, 6, 7]))),
            query("rooms").with_filter(filter("tags", "array-contains", json!("y"))),
            query("rooms").with_order_by(order_by("size", "desc")),
        ];
        persistence
            .run_transaction("compare", TransactionMode::ReadWrite, |txn| {
                seed(txn)?;
                let full: Vec<_> = queries
                    .iter()
                    .map(|q| engine.run_query(txn, q, SnapshotVersion::min(), &BTreeSet::new()))
                    .collect::<FirestoreResult<_>>()?;
                assert!(full.iter().all(|o| o.strategy == QueryStrategy::FullScan));

                let indexes = IndexManager::new();
                indexes.add_field_index(txn, "rooms", &field("size"), IndexKind::Ascending)?;
                indexes.add_field_index(txn, "rooms", &field("tags"), IndexKind::Contains)?;
                IndexBackfiller::new(indexes, RemoteDocumentCache::new()).backfill(txn, 100)?;
                // Arrives after the backfill and must still be found.
                store(txn, vec![doc("rooms/f", 9, json!({"size": 5, "tags": ["y"]}))])?;

                for (q, before) in queries.iter().zip(full) {
                    let indexed = engine.run_query(txn, q, SnapshotVersion::min(), &BTreeSet::new())?;
                    assert_eq!(indexed.strategy, QueryStrategy::Index);
                    let mut expected = keys(&before.documents);
                    if q.matches(&doc("rooms/f", 9, json!({"size": 5, "tags": ["y"]}))) {
                        expected.push("rooms/f".to_string());
                        expected.sort();
                    }
                    assert_eq!(keys(&indexed.documents), expected);
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn previous_results_add_documents_changed_since_snapshot() {
        let persistence = memory_persistence().await;
        let engine = engine();
        persistence
            .run_transaction("previous", TransactionMode::ReadWrite, |txn| {
                seed(txn)?;
                let q = query("rooms").with_filter(filter("size", ">=", json!(5)));
                let remote_keys: BTreeSet<_> = [key("rooms/b")].into_iter().collect();

                // rooms/c was read at version 3, after the snapshot; rooms/z and rooms/a are local.
                let outcome = engine.run_query(txn, &q, version(2), &remote_keys)?;
                assert_eq!(outcome.strategy, QueryStrategy::PreviousResults);
                assert_eq!(keys(&outcome.documents), vec!["rooms/a", "rooms/b", "rooms/c", "rooms/z"]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn limit_query_with_changed_edge_falls_back_to_full_scan() {
        let persistence = memory_persistence().await;
        let engine = engine();
        persistence
            .run_transaction("refill", TransactionMode::ReadWrite, |txn| {
                store(
                    txn,
                    vec![doc("rooms/a", 1, json!({"n": 1})), doc("rooms/b", 1, json!({"n": 2}))],
                )?;
                let q = query("rooms")
                    .with_order_by(order_by("n", "asc"))
                    .with_limit(1, LimitType::First);
                let remote_keys: BTreeSet<_> = [key("rooms/a")].into_iter().collect();

                let outcome = engine.run_query(txn, &q, version(1), &remote_keys)?;
                assert_eq!(outcome.strategy, QueryStrategy::PreviousResults);

                // The only previous match now sorts differently; the limit may admit another document.
                store(txn, vec![doc("rooms/a", 5, json!({"n": 10}))])?;
                let outcome = engine.run_query(txn, &q, version(1), &remote_keys)?;
                assert_eq!(outcome.strategy, QueryStrategy::FullScan);
                assert_eq!(keys(&outcome.documents), vec!["rooms/a", "rooms/b"]);

                let removed: BTreeSet<_> = [key("rooms/a"), key("rooms/gone")].into_iter().collect();
                let outcome = engine.run_query(txn, &q, version(5), &removed)?;
                assert_eq!(outcome.strategy, QueryStrategy::FullScan);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expensive_scans_request_indexes() {
        let persistence = memory_persistence().await;
        let settings = test_settings().with_index_auto_creation_thresholds(3, 2.0);
        let engine = engine().with_settings(&settings.with_index_auto_creation(true));
        persistence
            .run_transaction("auto", TransactionMode::ReadWrite, |txn| {
                seed(txn)?;
                let selective = query("rooms").with_filter(filter("size", "==", json!(8)));
                let outcome = engine.run_query(txn, &selective, SnapshotVersion::min(), &BTreeSet::new())?;
                assert_eq!(outcome.strategy, QueryStrategy::FullScan);
                assert_eq!(outcome.context.documents_read(), 4);

                let indexes = IndexManager::new().get_field_indexes(txn, Some("rooms"))?;
                assert_eq!(indexes.len(), 1);
                assert!(!indexes[0].state.ready);

                // Not used until the backfiller finished.
                let outcome = engine.run_query(txn, &selective, SnapshotVersion::min(), &BTreeSet::new())?;
                assert_eq!(outcome.strategy, QueryStrategy::FullScan);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cheap_scans_do_not_request_indexes() {
        let persistence = memory_persistence().await;
        let settings = test_settings()
            .with_index_auto_creation(true)
            .with_index_auto_creation_thresholds(3, 2.0);
        let engine = engine().with_settings(&settings);
        persistence
            .run_transaction("cheap", TransactionMode::ReadWrite, |txn| {
                seed(txn)?;
                let broad = query("rooms").with_filter(filter("size", ">=", json!(1)));
                engine.run_query(txn, &broad, SnapshotVersion::min(), &BTreeSet::new())?;
                assert!(IndexManager::new().get_field_indexes(txn, None)?.is_empty());
                Ok(())
            })
            .await
            .unwrap();
    }
}
