//! Hierarchy reconciler
//!
//! Aggregating providers flatten a universe (a main line plus spin-offs)
//! into one undifferentiated book list. This service pulls the canonical
//! structure from the authoritative provider, recreates the sub-series
//! locally, and moves misplaced books into them.
//!
//! Book moves only ever consider a restricted candidate set: series
//! already linked to the same parent, series matching a declared sibling's
//! provider id, and the parent itself. A global title search across the
//! whole catalog would move unrelated books that happen to share a title.

use shelfmark_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{books, series};
use crate::models::{ProviderKind, SeriesRef, SourceSeries};
use crate::services::providers::{ProviderCallError, ProviderGateway, SeriesQuery};

/// Options for one reconcile run
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Plan moves without writing anything
    pub dry_run: bool,
    /// Genre to stamp on records created during the run
    pub genre: Option<String>,
}

/// One executed (or planned, under dry-run) book move
#[derive(Debug, Clone)]
pub struct BookMove {
    pub book_id: Uuid,
    pub title: String,
    pub from_series: Uuid,
    pub to_series: String,
}

/// Outcome of one reconcile run
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub parent_id: Option<Uuid>,
    pub sub_series_created: usize,
    pub sub_series_linked: usize,
    pub books_moved: usize,
    pub moves: Vec<BookMove>,
}

/// A series flagged as probably flattened
#[derive(Debug)]
pub struct MisflattenedSeries {
    pub series_id: Uuid,
    pub name: String,
    pub stored_count: i64,
    pub canonical_count: usize,
    pub parent: SeriesRef,
}

/// Hierarchy reconciler over the canonical provider
pub struct HierarchyReconciler {
    db: SqlitePool,
    gateway: Arc<ProviderGateway>,
    canonical: ProviderKind,
}

impl HierarchyReconciler {
    pub fn new(db: SqlitePool, gateway: Arc<ProviderGateway>) -> Self {
        Self {
            db,
            gateway,
            canonical: ProviderKind::Isfdb,
        }
    }

    async fn fetch_canonical(&self, query: SeriesQuery) -> Result<Option<SourceSeries>> {
        match self.gateway.fetch(self.canonical, &query).await {
            Ok(fetch) => Ok(fetch.series),
            Err(ProviderCallError::Storage(e)) => Err(e),
            Err(e) => Err(Error::Internal(format!(
                "Canonical provider unavailable: {}",
                e
            ))),
        }
    }

    /// Repair the hierarchy under one canonical parent series.
    ///
    /// `parent_external_id` is the authoritative provider's id for the
    /// parent/universe record. Idempotent: a second run over an already
    /// repaired parent performs zero moves.
    pub async fn reconcile(
        &self,
        parent_external_id: &str,
        options: &ReconcileOptions,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let canonical_parent = match self
            .fetch_canonical(SeriesQuery::ByExternalId(parent_external_id.to_string()))
            .await?
        {
            Some(series) => series,
            None => {
                tracing::warn!(
                    external_id = parent_external_id,
                    "Canonical provider has no record for parent, nothing to reconcile"
                );
                return Ok(report);
            }
        };

        // The parent itself is not a sub-series; its creation is not counted
        let mut parent_created = 0;
        let parent_id = self
            .find_or_create(
                &canonical_parent.name,
                canonical_parent.external_id.as_deref(),
                canonical_parent.author.as_deref(),
                None,
                options,
                &mut parent_created,
            )
            .await?;
        report.parent_id = parent_id;

        let sibling_ids: Vec<String> = canonical_parent
            .sub_series
            .iter()
            .filter_map(|r| r.external_id.clone())
            .collect();

        for sub_ref in &canonical_parent.sub_series {
            self.reconcile_sub_series(
                sub_ref,
                parent_id,
                &sibling_ids,
                &canonical_parent,
                options,
                &mut report,
            )
            .await?;
        }

        if let Some(parent_id) = parent_id {
            if !options.dry_run {
                series::update_total_books(&self.db, parent_id).await?;
            }
        }

        tracing::info!(
            external_id = parent_external_id,
            created = report.sub_series_created,
            linked = report.sub_series_linked,
            moved = report.books_moved,
            dry_run = options.dry_run,
            "Hierarchy reconcile complete"
        );

        Ok(report)
    }

    /// Find a series by provider id, then by normalized name; create it
    /// when absent (and not in dry-run). Returns its local id.
    async fn find_or_create(
        &self,
        name: &str,
        external_id: Option<&str>,
        author: Option<&str>,
        parent_id: Option<Uuid>,
        options: &ReconcileOptions,
        created_counter: &mut usize,
    ) -> Result<Option<Uuid>> {
        if let Some(ext_id) = external_id {
            if let Some(existing) = series::find_by_provider_id(&self.db, self.canonical, ext_id).await? {
                return Ok(Some(existing.id));
            }
        }

        if let Some(existing) = series::find_by_normalized_name(&self.db, name).await? {
            // Back-fill the provider id we just learned
            if existing.provider_id(self.canonical).is_none() && external_id.is_some() {
                let mut update = existing.clone();
                update.isfdb_id = external_id.map(|s| s.to_string());
                if !options.dry_run {
                    series::upsert_series(&self.db, &update).await?;
                }
            }
            return Ok(Some(existing.id));
        }

        if options.dry_run {
            return Ok(None);
        }

        let mut created = series::Series::new(name).with_author(author);
        created.isfdb_id = external_id.map(|s| s.to_string());
        created.genre = options.genre.clone();
        created.parent_series_id = parent_id;
        created.confidence = 0.9;
        series::upsert_series(&self.db, &created).await?;
        *created_counter += 1;

        tracing::info!(name = %name, external_id = ?external_id, "Created series from canonical structure");
        Ok(Some(created.id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_sub_series(
        &self,
        sub_ref: &SeriesRef,
        parent_id: Option<Uuid>,
        sibling_ids: &[String],
        canonical_parent: &SourceSeries,
        options: &ReconcileOptions,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let sub_id = self
            .find_or_create(
                &sub_ref.name,
                sub_ref.external_id.as_deref(),
                canonical_parent.author.as_deref(),
                parent_id,
                options,
                &mut report.sub_series_created,
            )
            .await?;

        // Back-fill the parent link on a pre-existing sub-series
        if let (Some(sub_id), Some(parent_id)) = (sub_id, parent_id) {
            if sub_id != parent_id {
                if let Some(stored) = series::find_by_id(&self.db, sub_id).await? {
                    if stored.parent_series_id.is_none() && !options.dry_run {
                        match series::set_parent(&self.db, sub_id, parent_id).await {
                            Ok(()) => report.sub_series_linked += 1,
                            Err(Error::InvalidInput(msg)) => {
                                tracing::warn!(sub = %sub_ref.name, %msg, "Skipping parent link");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }

        let canonical_books = match sub_ref.external_id.as_deref() {
            Some(ext_id) => self
                .fetch_canonical(SeriesQuery::ByExternalId(ext_id.to_string()))
                .await?
                .map(|s| s.books)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        if canonical_books.is_empty() {
            return Ok(());
        }

        let candidates = self.candidate_set(parent_id, sibling_ids, sub_id).await?;

        for canonical_book in &canonical_books {
            for &candidate_id in &candidates {
                let found =
                    books::find_in_series_by_title(&self.db, candidate_id, &canonical_book.title)
                        .await?;

                let Some(found) = found else { continue };
                if !positions_compatible(found.position, canonical_book.position) {
                    continue;
                }

                // Already present in the sub-series: leave the stray copy
                // for the dedup pass instead of creating a duplicate.
                if let Some(sub_id) = sub_id {
                    if books::find_in_series_by_title(&self.db, sub_id, &canonical_book.title)
                        .await?
                        .is_some()
                    {
                        break;
                    }
                    if !options.dry_run {
                        books::move_to_series(&self.db, found.id, sub_id).await?;
                    }
                }

                report.books_moved += 1;
                report.moves.push(BookMove {
                    book_id: found.id,
                    title: found.title.clone(),
                    from_series: candidate_id,
                    to_series: sub_ref.name.clone(),
                });
                break;
            }
        }

        if let Some(sub_id) = sub_id {
            if !options.dry_run {
                series::update_total_books(&self.db, sub_id).await?;
            }
        }

        Ok(())
    }

    /// The restricted candidate set for book moves
    async fn candidate_set(
        &self,
        parent_id: Option<Uuid>,
        sibling_ids: &[String],
        exclude: Option<Uuid>,
    ) -> Result<Vec<Uuid>> {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut candidates = Vec::new();

        if let Some(parent_id) = parent_id {
            for child in series::children_of(&self.db, parent_id).await? {
                if seen.insert(child.id) {
                    candidates.push(child.id);
                }
            }
            if seen.insert(parent_id) {
                candidates.push(parent_id);
            }
        }

        for sibling_ext_id in sibling_ids {
            if let Some(sibling) =
                series::find_by_provider_id(&self.db, self.canonical, sibling_ext_id).await?
            {
                if seen.insert(sibling.id) {
                    candidates.push(sibling.id);
                }
            }
        }

        Ok(candidates
            .into_iter()
            .filter(|id| Some(*id) != exclude)
            .collect())
    }

    /// Scan for series that look flattened: stored book count exceeds the
    /// canonical count by more than 2 and the canonical record declares a
    /// parent. These are the candidates to queue for [`Self::reconcile`].
    pub async fn find_misflattened_series(&self, limit: i64) -> Result<Vec<MisflattenedSeries>> {
        let mut flagged = Vec::new();

        for stored in series::list_with_provider_id(&self.db, self.canonical, limit).await? {
            let Some(ext_id) = stored.provider_id(self.canonical) else {
                continue;
            };

            let canonical = match self
                .fetch_canonical(SeriesQuery::ByExternalId(ext_id.to_string()))
                .await
            {
                Ok(Some(series)) => series,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(series = %stored.name, error = %e, "Skipping misflatten check");
                    continue;
                }
            };

            let Some(parent) = canonical.parent else {
                continue;
            };

            if stored.total_books > canonical.books.len() as i64 + 2 {
                tracing::info!(
                    series = %stored.name,
                    stored = stored.total_books,
                    canonical = canonical.books.len(),
                    "Series looks flattened"
                );
                flagged.push(MisflattenedSeries {
                    series_id: stored.id,
                    name: stored.name,
                    stored_count: stored.total_books,
                    canonical_count: canonical.books.len(),
                    parent,
                });
            }
        }

        Ok(flagged)
    }

    /// Remove from every parent the books that now live in one of its
    /// children (normalized-title match). Idempotent.
    pub async fn dedup_parents(&self) -> Result<usize> {
        let mut removed = 0;

        for parent_id in series::parent_ids(&self.db).await? {
            let mut child_titles: HashSet<String> = HashSet::new();
            for child in series::children_of(&self.db, parent_id).await? {
                for book in books::list_for_series(&self.db, child.id).await? {
                    child_titles.insert(book.title_normalized);
                }
            }

            let mut removed_here = 0;
            for book in books::list_for_series(&self.db, parent_id).await? {
                if child_titles.contains(&book.title_normalized) {
                    books::delete_book(&self.db, book.id).await?;
                    removed_here += 1;
                }
            }

            if removed_here > 0 {
                series::update_total_books(&self.db, parent_id).await?;
                tracing::info!(parent = %parent_id, removed = removed_here, "Removed duplicated parent books");
                removed += removed_here;
            }
        }

        Ok(removed)
    }

    /// Back-fill parent references: for any series whose canonical record
    /// declares a parent that already exists locally, link it.
    pub async fn link_sub_series(&self, limit: i64) -> Result<usize> {
        let mut linked = 0;

        for stored in series::list_with_provider_id(&self.db, self.canonical, limit).await? {
            if stored.parent_series_id.is_some() {
                continue;
            }
            let Some(ext_id) = stored.provider_id(self.canonical) else {
                continue;
            };

            let canonical = match self
                .fetch_canonical(SeriesQuery::ByExternalId(ext_id.to_string()))
                .await
            {
                Ok(Some(series)) => series,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(series = %stored.name, error = %e, "Skipping link pass item");
                    continue;
                }
            };

            let Some(parent_ref) = canonical.parent else {
                continue;
            };

            let local_parent = match parent_ref.external_id.as_deref() {
                Some(parent_ext) => {
                    series::find_by_provider_id(&self.db, self.canonical, parent_ext).await?
                }
                None => None,
            };
            let local_parent = match local_parent {
                Some(p) => Some(p),
                None => series::find_by_normalized_name(&self.db, &parent_ref.name).await?,
            };

            if let Some(parent) = local_parent {
                match series::set_parent(&self.db, stored.id, parent.id).await {
                    Ok(()) => {
                        tracing::info!(child = %stored.name, parent = %parent.name, "Linked sub-series to parent");
                        linked += 1;
                    }
                    Err(Error::InvalidInput(msg)) => {
                        tracing::warn!(child = %stored.name, %msg, "Skipping link");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(linked)
    }
}

/// Positions match when either side is unset or they agree
fn positions_compatible(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => (x - y).abs() < 1e-6,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::SourceBook;
    use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::services::providers::testing::ScriptedProvider;
    use crate::services::retry::RetryPolicy;

    fn canonical_book(title: &str, position: f64) -> SourceBook {
        SourceBook {
            external_id: None,
            title: title.to_string(),
            position: Some(position),
            author: None,
            year: None,
            isbn: None,
            description: None,
            ebook_available: false,
            audiobook_available: false,
        }
    }

    fn canonical_series(
        ext_id: &str,
        name: &str,
        books: Vec<SourceBook>,
        sub_series: Vec<SeriesRef>,
        parent: Option<SeriesRef>,
    ) -> SourceSeries {
        SourceSeries {
            provider: ProviderKind::Isfdb,
            external_id: Some(ext_id.to_string()),
            name: name.to_string(),
            author: Some("Will Wight".to_string()),
            description: None,
            books,
            sub_series,
            parent,
            tags: Vec::new(),
        }
    }

    fn sub_ref(ext_id: &str, name: &str) -> SeriesRef {
        SeriesRef {
            external_id: Some(ext_id.to_string()),
            name: name.to_string(),
            position: None,
        }
    }

    async fn build_reconciler(pool: &SqlitePool, provider: Arc<ScriptedProvider>) -> HierarchyReconciler {
        let mut gateway = ProviderGateway::new(
            pool.clone(),
            RetryPolicy {
                max_attempts: 1,
                initial_backoff: std::time::Duration::from_millis(1),
                max_backoff: std::time::Duration::from_millis(2),
                multiplier: 2.0,
            },
        );
        gateway.register(
            provider,
            Arc::new(CircuitBreaker::new("isfdb", CircuitBreakerConfig::default())),
            None,
        );
        HierarchyReconciler::new(pool.clone(), Arc::new(gateway))
    }

    /// Seed the canonical structure: universe P1 with sub-series S1 and S2
    fn script_universe(provider: &ScriptedProvider) {
        provider.script_found(
            "id:P1",
            canonical_series(
                "P1",
                "Cradle Universe",
                Vec::new(),
                vec![sub_ref("S1", "Cradle"), sub_ref("S2", "Cradle: Side Stories")],
                None,
            ),
        );
        provider.script_found(
            "id:S1",
            canonical_series(
                "S1",
                "Cradle",
                vec![canonical_book("Unsouled", 1.0), canonical_book("Soulsmith", 2.0)],
                Vec::new(),
                Some(sub_ref("P1", "Cradle Universe")),
            ),
        );
        provider.script_found(
            "id:S2",
            canonical_series(
                "S2",
                "Cradle: Side Stories",
                vec![canonical_book("The Three Sisters", 1.0)],
                Vec::new(),
                Some(sub_ref("P1", "Cradle Universe")),
            ),
        );
    }

    /// Seed a flat local series holding the whole universe in one list
    async fn seed_flat_series(pool: &SqlitePool) -> series::Series {
        let mut flat = series::Series::new("Cradle Universe");
        flat.isfdb_id = Some("P1".to_string());
        series::upsert_series(pool, &flat).await.unwrap();

        for (title, position) in [
            ("Unsouled", Some(1.0)),
            ("Soulsmith", Some(2.0)),
            ("The Three Sisters", Some(1.0)),
            ("Anthology Extra", None),
        ] {
            let mut book = books::SeriesBook::new(flat.id, title);
            book.position = position;
            books::upsert_book(pool, &book).await.unwrap();
        }
        series::update_total_books(pool, flat.id).await.unwrap();
        flat
    }

    #[tokio::test]
    async fn test_reconcile_splits_flattened_series() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Isfdb));
        script_universe(&provider);
        let flat = seed_flat_series(&pool).await;

        let reconciler = build_reconciler(&pool, provider).await;
        let report = reconciler
            .reconcile("P1", &ReconcileOptions::default())
            .await
            .unwrap();

        assert_eq!(report.parent_id, Some(flat.id));
        assert_eq!(report.sub_series_created, 2);
        assert_eq!(report.books_moved, 3);

        // Sub-series exist, linked to the parent, with the right books
        let s1 = series::find_by_provider_id(&pool, ProviderKind::Isfdb, "S1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s1.parent_series_id, Some(flat.id));
        let s1_books = books::list_for_series(&pool, s1.id).await.unwrap();
        let titles: Vec<&str> = s1_books.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["Unsouled", "Soulsmith"]);

        let s2 = series::find_by_provider_id(&pool, ProviderKind::Isfdb, "S2")
            .await
            .unwrap()
            .unwrap();
        let s2_books = books::list_for_series(&pool, s2.id).await.unwrap();
        assert_eq!(s2_books.len(), 1);
        assert_eq!(s2_books[0].title, "The Three Sisters");

        // The flat series keeps only its own direct books, count recomputed
        let parent = series::find_by_id(&pool, flat.id).await.unwrap().unwrap();
        assert_eq!(parent.total_books, 1);
        let remaining = books::list_for_series(&pool, flat.id).await.unwrap();
        assert_eq!(remaining[0].title, "Anthology Extra");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Isfdb));
        script_universe(&provider);
        seed_flat_series(&pool).await;

        let reconciler = build_reconciler(&pool, provider).await;
        reconciler
            .reconcile("P1", &ReconcileOptions::default())
            .await
            .unwrap();
        let second = reconciler
            .reconcile("P1", &ReconcileOptions::default())
            .await
            .unwrap();

        assert_eq!(second.sub_series_created, 0);
        assert_eq!(second.books_moved, 0);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Isfdb));
        script_universe(&provider);
        let flat = seed_flat_series(&pool).await;

        let reconciler = build_reconciler(&pool, provider).await;
        let options = ReconcileOptions {
            dry_run: true,
            genre: None,
        };
        let report = reconciler.reconcile("P1", &options).await.unwrap();

        // Planned, not executed
        assert_eq!(report.books_moved, 3);
        assert_eq!(report.moves.len(), 3);
        assert!(series::find_by_provider_id(&pool, ProviderKind::Isfdb, "S1")
            .await
            .unwrap()
            .is_none());
        let untouched = books::list_for_series(&pool, flat.id).await.unwrap();
        assert_eq!(untouched.len(), 4);
    }

    #[tokio::test]
    async fn test_find_misflattened_series() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Isfdb));

        // Canonical: 2 books, declared parent
        provider.script_found(
            "id:S1",
            canonical_series(
                "S1",
                "Cradle",
                vec![canonical_book("Unsouled", 1.0), canonical_book("Soulsmith", 2.0)],
                Vec::new(),
                Some(sub_ref("P1", "Cradle Universe")),
            ),
        );

        // Local account claims 6 books
        let mut bloated = series::Series::new("Cradle");
        bloated.isfdb_id = Some("S1".to_string());
        bloated.total_books = 6;
        series::upsert_series(&pool, &bloated).await.unwrap();

        let reconciler = build_reconciler(&pool, provider).await;
        let flagged = reconciler.find_misflattened_series(100).await.unwrap();

        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].series_id, bloated.id);
        assert_eq!(flagged[0].canonical_count, 2);
        assert_eq!(flagged[0].parent.external_id.as_deref(), Some("P1"));
    }

    #[tokio::test]
    async fn test_dedup_parents_idempotent() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Isfdb));

        let parent = series::Series::new("Cradle Universe");
        series::upsert_series(&pool, &parent).await.unwrap();
        let mut child = series::Series::new("Cradle");
        child.parent_series_id = Some(parent.id);
        series::upsert_series(&pool, &child).await.unwrap();

        // "Unsouled" lives in the child and, duplicated, in the parent
        books::upsert_book(&pool, &books::SeriesBook::new(child.id, "Unsouled"))
            .await
            .unwrap();
        books::upsert_book(&pool, &books::SeriesBook::new(parent.id, "The Unsouled"))
            .await
            .unwrap();
        books::upsert_book(&pool, &books::SeriesBook::new(parent.id, "Anthology Extra"))
            .await
            .unwrap();

        let reconciler = build_reconciler(&pool, provider).await;
        assert_eq!(reconciler.dedup_parents().await.unwrap(), 1);

        let remaining = books::list_for_series(&pool, parent.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].title, "Anthology Extra");

        // Re-running after all duplicates are gone is a no-op
        assert_eq!(reconciler.dedup_parents().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_link_sub_series_backfills_parent() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Isfdb));
        provider.script_found(
            "id:S1",
            canonical_series(
                "S1",
                "Cradle",
                Vec::new(),
                Vec::new(),
                Some(sub_ref("P1", "Cradle Universe")),
            ),
        );

        let mut parent = series::Series::new("Cradle Universe");
        parent.isfdb_id = Some("P1".to_string());
        series::upsert_series(&pool, &parent).await.unwrap();

        let mut orphan = series::Series::new("Cradle");
        orphan.isfdb_id = Some("S1".to_string());
        series::upsert_series(&pool, &orphan).await.unwrap();

        let reconciler = build_reconciler(&pool, provider).await;
        assert_eq!(reconciler.link_sub_series(100).await.unwrap(), 1);

        let linked = series::find_by_id(&pool, orphan.id).await.unwrap().unwrap();
        assert_eq!(linked.parent_series_id, Some(parent.id));
    }
}
