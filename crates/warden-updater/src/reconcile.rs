//! Multi-source update reconciliation.
//!
//! Every applicable (application, source) pair is queried concurrently,
//! plus one batched package-manager query. Concurrency is bounded by a
//! semaphore and each query by the network timeout; a query that fails or
//! times out contributes nothing. The merged result holds at most one
//! candidate per application.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::model::{InstalledApplication, UpdateCandidate};
use crate::sources::{BatchUpdateSource, UpdateSource};
use crate::summary::ChangelogSummarizer;
use crate::version;

/// Default bound on in-flight source queries.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Queries every source and merges the answers.
pub struct UpdateReconciler {
    sources: Vec<Arc<dyn UpdateSource>>,
    batch_sources: Vec<Arc<dyn BatchUpdateSource>>,
    summarizer: Option<Arc<dyn ChangelogSummarizer>>,
    max_concurrent: usize,
    query_timeout: Duration,
    batch_timeout: Duration,
    summary_timeout: Duration,
}

impl std::fmt::Debug for UpdateReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateReconciler")
            .field("sources", &self.sources.len())
            .field("batch_sources", &self.batch_sources.len())
            .field("summarizer", &self.summarizer.is_some())
            .field("max_concurrent", &self.max_concurrent)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl UpdateReconciler {
    pub fn new(query_timeout: Duration) -> Self {
        Self {
            sources: Vec::new(),
            batch_sources: Vec::new(),
            summarizer: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            query_timeout,
            batch_timeout: query_timeout,
            summary_timeout: query_timeout,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn UpdateSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_batch_source(mut self, source: Arc<dyn BatchUpdateSource>, timeout: Duration) -> Self {
        self.batch_sources.push(source);
        self.batch_timeout = timeout;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn ChangelogSummarizer>, timeout: Duration) -> Self {
        self.summarizer = Some(summarizer);
        self.summary_timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Ranked, deduplicated candidates for `apps`.
    ///
    /// Every query has finished (or timed out) when this returns.
    pub async fn reconcile(&self, apps: &[InstalledApplication]) -> Vec<UpdateCandidate> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        let mut tasks: Vec<BoxFuture<'_, Option<Vec<UpdateCandidate>>>> = Vec::new();
        for app in apps {
            for source in self.sources.iter().filter(|source| source.applies_to(app)) {
                tasks.push(
                    self.query_one(Arc::clone(&semaphore), Arc::clone(source), app)
                        .boxed(),
                );
            }
        }
        for source in &self.batch_sources {
            tasks.push(
                self.query_batch(Arc::clone(&semaphore), Arc::clone(source), apps)
                    .boxed(),
            );
        }

        let query_count = tasks.len();
        let found: Vec<UpdateCandidate> = join_all(tasks).await.into_iter().flatten().flatten().collect();
        debug!(queries = query_count, found = found.len(), "Source queries finished");

        let upgrades: Vec<UpdateCandidate> = found
            .into_iter()
            .filter(|candidate| {
                let newer = candidate.is_upgrade();
                if !newer {
                    debug!(app = %candidate.identifier(), version = %candidate.version, "Discarding non-upgrade");
                }
                newer
            })
            .collect();

        let mut merged = dedup_candidates(upgrades);
        self.summarize(&mut merged).await;
        sort_candidates(&mut merged);

        info!(apps = apps.len(), updates = merged.len(), "Reconciliation finished");
        merged
    }

    async fn query_one(
        &self,
        semaphore: Arc<Semaphore>,
        source: Arc<dyn UpdateSource>,
        app: &InstalledApplication,
    ) -> Option<Vec<UpdateCandidate>> {
        let _permit = semaphore.acquire_owned().await.ok()?;
        match tokio::time::timeout(self.query_timeout, source.fetch_candidate(app)).await {
            Ok(candidate) => candidate.map(|c| vec![c]),
            Err(_) => {
                warn!(app = %app.identifier, source = %source.kind(), "Source query timed out");
                None
            }
        }
    }

    async fn query_batch(
        &self,
        semaphore: Arc<Semaphore>,
        source: Arc<dyn BatchUpdateSource>,
        apps: &[InstalledApplication],
    ) -> Option<Vec<UpdateCandidate>> {
        let _permit = semaphore.acquire_owned().await.ok()?;
        match tokio::time::timeout(self.batch_timeout, source.fetch_batch(apps)).await {
            Ok(candidates) => Some(candidates),
            Err(_) => {
                warn!(source = %source.kind(), "Batch source query timed out");
                None
            }
        }
    }

    async fn summarize(&self, candidates: &mut [UpdateCandidate]) {
        let Some(summarizer) = &self.summarizer else {
            return;
        };

        let summaries = join_all(candidates.iter().map(|candidate| {
            let summarizer = Arc::clone(summarizer);
            async move {
                let changelog = candidate.changelog.as_deref()?;
                match tokio::time::timeout(self.summary_timeout, summarizer.summarize(changelog)).await {
                    Ok(summary) => summary,
                    Err(_) => {
                        debug!(app = %candidate.identifier(), "Summarizer timed out");
                        None
                    }
                }
            }
        }))
        .await;

        for (candidate, summary) in candidates.iter_mut().zip(summaries) {
            if summary.is_some() {
                candidate.summary = summary;
            }
        }
    }
}

/// Ordering used to pick the surviving candidate for one application.
///
/// Greater wins: higher version, then security-flagged, then the
/// higher-priority source.
pub fn preference(a: &UpdateCandidate, b: &UpdateCandidate) -> Ordering {
    version::compare(&a.version, &b.version)
        .then_with(|| a.is_security.cmp(&b.is_security))
        .then_with(|| b.source.cmp(&a.source))
}

/// Keep one candidate per identifier.
pub fn dedup_candidates(candidates: Vec<UpdateCandidate>) -> Vec<UpdateCandidate> {
    let mut best: HashMap<String, UpdateCandidate> = HashMap::new();
    for candidate in candidates {
        match best.get(candidate.identifier()) {
            Some(current) if preference(&candidate, current) != Ordering::Greater => {}
            _ => {
                best.insert(candidate.identifier().to_string(), candidate);
            }
        }
    }
    best.into_values().collect()
}

/// Security first, then display name (case-insensitive), then identifier.
pub fn sort_candidates(candidates: &mut [UpdateCandidate]) {
    candidates.sort_by(|a, b| {
        b.is_security
            .cmp(&a.is_security)
            .then_with(|| {
                a.application
                    .name
                    .to_lowercase()
                    .cmp(&b.application.name.to_lowercase())
            })
            .then_with(|| a.identifier().cmp(b.identifier()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Source answering from a fixed table, optionally after a delay.
    struct TableSource {
        kind: SourceKind,
        offers: HashMap<String, (String, Option<String>)>,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl TableSource {
        fn new(kind: SourceKind) -> Self {
            Self {
                kind,
                offers: HashMap::new(),
                delay: Duration::ZERO,
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn offer(mut self, id: &str, version: &str, changelog: Option<&str>) -> Self {
            self.offers
                .insert(id.to_string(), (version.to_string(), changelog.map(str::to_string)));
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl UpdateSource for TableSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn applies_to(&self, _app: &InstalledApplication) -> bool {
            true
        }

        async fn fetch_candidate(&self, app: &InstalledApplication) -> Option<UpdateCandidate> {
            let now = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(now, AtomicOrdering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);

            let (version, changelog) = self.offers.get(&app.identifier)?;
            let mut candidate = UpdateCandidate::new(app.clone(), version.clone(), "https://dl/x.dmg", self.kind);
            if let Some(text) = changelog {
                candidate = candidate.with_changelog(text.clone());
            }
            Some(candidate)
        }
    }

    struct TableBatch(Vec<(String, String)>);

    #[async_trait]
    impl BatchUpdateSource for TableBatch {
        fn kind(&self) -> SourceKind {
            SourceKind::PackageRegistry
        }

        async fn fetch_batch(&self, apps: &[InstalledApplication]) -> Vec<UpdateCandidate> {
            apps.iter()
                .filter_map(|app| {
                    let (_, version) = self.0.iter().find(|(id, _)| id == &app.identifier)?;
                    Some(UpdateCandidate::new(app.clone(), version.clone(), "", SourceKind::PackageRegistry))
                })
                .collect()
        }
    }

    struct EchoSummarizer;

    #[async_trait]
    impl ChangelogSummarizer for EchoSummarizer {
        async fn summarize(&self, changelog: &str) -> Option<String> {
            Some(format!("summary: {changelog}"))
        }
    }

    struct StuckSummarizer;

    #[async_trait]
    impl ChangelogSummarizer for StuckSummarizer {
        async fn summarize(&self, _changelog: &str) -> Option<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Some("never".into())
        }
    }

    fn app(id: &str, name: &str, version: &str) -> InstalledApplication {
        InstalledApplication::new(id, name, version, format!("/Applications/{name}.app"))
    }

    #[tokio::test]
    async fn test_higher_version_from_feed_beats_release_api() {
        let apps = vec![app("com.example.a", "Alpha", "2.0")];
        let reconciler = UpdateReconciler::new(Duration::from_secs(5))
            .with_source(Arc::new(TableSource::new(SourceKind::Sparkle).offer("com.example.a", "2.1", None)))
            .with_source(Arc::new(TableSource::new(SourceKind::ReleaseApi).offer("com.example.a", "2.0", None)));

        let out = reconciler.reconcile(&apps).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].version, "2.1");
        assert_eq!(out[0].source, SourceKind::Sparkle);
    }

    #[tokio::test]
    async fn test_security_flag_outranks_source_priority() {
        let apps = vec![app("com.example.a", "Alpha", "1.9")];
        let reconciler = UpdateReconciler::new(Duration::from_secs(5))
            .with_source(Arc::new(TableSource::new(SourceKind::Sparkle).offer("com.example.a", "2.0", None)))
            .with_source(Arc::new(
                TableSource::new(SourceKind::ReleaseApi).offer("com.example.a", "2.0", Some("fix CVE")),
            ));

        let out = reconciler.reconcile(&apps).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].version, "2.0");
        assert!(out[0].is_security);
        assert_eq!(out[0].source, SourceKind::ReleaseApi);
    }

    #[tokio::test]
    async fn test_tie_breaks_on_source_priority() {
        let apps = vec![app("com.example.a", "Alpha", "1.0")];
        let reconciler = UpdateReconciler::new(Duration::from_secs(5))
            .with_source(Arc::new(TableSource::new(SourceKind::ReleaseApi).offer("com.example.a", "2.0", None)))
            .with_source(Arc::new(TableSource::new(SourceKind::Sparkle).offer("com.example.a", "2.0", None)))
            .with_batch_source(
                Arc::new(TableBatch(vec![("com.example.a".into(), "2.0".into())])),
                Duration::from_secs(5),
            );

        let out = reconciler.reconcile(&apps).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, SourceKind::Sparkle);
    }

    #[tokio::test]
    async fn test_highest_version_wins_and_non_upgrades_dropped() {
        let apps = vec![app("com.example.a", "Alpha", "1.0"), app("com.example.b", "Beta", "5.0")];
        let reconciler = UpdateReconciler::new(Duration::from_secs(5))
            .with_source(Arc::new(
                TableSource::new(SourceKind::Sparkle)
                    .offer("com.example.a", "1.5", None)
                    .offer("com.example.b", "4.0", None),
            ))
            .with_source(Arc::new(TableSource::new(SourceKind::ReleaseApi).offer("com.example.a", "1.10", None)));

        let out = reconciler.reconcile(&apps).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].identifier(), "com.example.a");
        assert_eq!(out[0].version, "1.10");
    }

    #[tokio::test]
    async fn test_security_first_then_name() {
        let apps = vec![
            app("com.example.z", "zebra", "1.0"),
            app("com.example.a", "Apple", "1.0"),
            app("com.example.m", "Mango", "1.0"),
        ];
        let reconciler = UpdateReconciler::new(Duration::from_secs(5)).with_source(Arc::new(
            TableSource::new(SourceKind::Sparkle)
                .offer("com.example.z", "2.0", Some("security hardening"))
                .offer("com.example.a", "2.0", None)
                .offer("com.example.m", "2.0", None),
        ));

        let out = reconciler.reconcile(&apps).await;
        let ids: Vec<_> = out.iter().map(|c| c.identifier()).collect();
        assert_eq!(ids, vec!["com.example.z", "com.example.a", "com.example.m"]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let apps: Vec<_> = (0..12).map(|i| app(&format!("com.example.{i}"), "App", "1.0")).collect();
        let source = TableSource::new(SourceKind::Sparkle).delayed(Duration::from_millis(20));
        let peak = Arc::clone(&source.peak);

        let reconciler = UpdateReconciler::new(Duration::from_secs(5))
            .with_source(Arc::new(source))
            .with_max_concurrent(3);
        let out = reconciler.reconcile(&apps).await;

        assert!(out.is_empty());
        assert!(peak.load(AtomicOrdering::SeqCst) <= 3);
        assert!(peak.load(AtomicOrdering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out_without_blocking_others() {
        let apps = vec![app("com.example.a", "Alpha", "1.0")];
        let reconciler = UpdateReconciler::new(Duration::from_secs(2))
            .with_source(Arc::new(
                TableSource::new(SourceKind::ReleaseApi)
                    .offer("com.example.a", "9.0", None)
                    .delayed(Duration::from_secs(60)),
            ))
            .with_source(Arc::new(TableSource::new(SourceKind::Sparkle).offer("com.example.a", "2.0", None)));

        let out = reconciler.reconcile(&apps).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].version, "2.0");
    }

    #[tokio::test]
    async fn test_summarizer_fills_summary() {
        let apps = vec![app("com.example.a", "Alpha", "1.0"), app("com.example.b", "Beta", "1.0")];
        let reconciler = UpdateReconciler::new(Duration::from_secs(5))
            .with_source(Arc::new(
                TableSource::new(SourceKind::Sparkle)
                    .offer("com.example.a", "2.0", Some("New toolbar"))
                    .offer("com.example.b", "2.0", None),
            ))
            .with_summarizer(Arc::new(EchoSummarizer), Duration::from_secs(5));

        let out = reconciler.reconcile(&apps).await;
        assert_eq!(out[0].summary.as_deref(), Some("summary: New toolbar"));
        assert_eq!(out[1].summary, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summarizer_timeout_leaves_summary_unset() {
        let apps = vec![app("com.example.a", "Alpha", "1.0")];
        let reconciler = UpdateReconciler::new(Duration::from_secs(5))
            .with_source(Arc::new(
                TableSource::new(SourceKind::Sparkle).offer("com.example.a", "2.0", Some("notes")),
            ))
            .with_summarizer(Arc::new(StuckSummarizer), Duration::from_secs(1));

        let out = reconciler.reconcile(&apps).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].summary.is_none());
    }

    #[test]
    fn test_dedup_keeps_one_per_identifier() {
        let a = app("com.example.a", "Alpha", "1.0");
        let candidates = vec![
            UpdateCandidate::new(a.clone(), "1.1", "", SourceKind::PackageRegistry),
            UpdateCandidate::new(a.clone(), "1.2", "", SourceKind::ReleaseApi),
            UpdateCandidate::new(a, "1.2", "", SourceKind::PackageRegistry),
        ];
        let out = dedup_candidates(candidates);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].version, "1.2");
        assert_eq!(out[0].source, SourceKind::PackageRegistry);
    }
}
