use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::aggregate;
use crate::collector::{Collection, Collector};
use crate::config::PipelineConfig;
use crate::error::{CollectError, ServiceError};
use crate::filters::{Facet, FilterState, ScopeConstraint};
use crate::models::{AggregateBucket, FilterOptions, Snapshot, TrendModel};
use crate::service::EvaluationService;
use crate::trend::forecast;

/// Snapshots a slow subscriber may fall behind by before it starts skipping.
const SNAPSHOT_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Debouncing,
    Collecting,
    Aggregating,
    Forecasting,
    Published,
    /// The latest cycle failed; the previous snapshot stays current.
    Failed,
}

impl PipelineState {
    pub fn is_loading(self) -> bool {
        matches!(
            self,
            PipelineState::Debouncing
                | PipelineState::Collecting
                | PipelineState::Aggregating
                | PipelineState::Forecasting
        )
    }
}

/// Collection plus the filter-option fetch for one filter selection.
pub struct Pipeline {
    collector: Collector,
    service: Arc<dyn EvaluationService>,
}

impl Pipeline {
    pub fn new(
        service: Arc<dyn EvaluationService>,
        scope: Option<ScopeConstraint>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            collector: Collector::new(Arc::clone(&service), scope, config),
            service,
        }
    }

    pub fn scope(&self) -> Option<&ScopeConstraint> {
        self.collector.scope()
    }

    /// Collects records and fetches filter options concurrently. A failed
    /// option fetch is logged and does not fail the collection.
    pub async fn gather(
        &self,
        filters: &FilterState,
    ) -> Result<(Collection, Option<FilterOptions>), CollectError> {
        let query = self.collector.query_for(filters);
        let (collection, options) = tokio::join!(
            self.collector.collect(filters),
            self.service.fetch_filter_options(&query)
        );

        let options = match options {
            Ok(options) => Some(options),
            Err(err) => {
                warn!(error = %err, "filter options unavailable");
                None
            }
        };
        Ok((collection?, options))
    }

    pub async fn filter_options(&self, filters: &FilterState) -> Result<FilterOptions, ServiceError> {
        let query = self.collector.query_for(filters);
        self.service.fetch_filter_options(&query).await
    }

    /// One full cycle outside the orchestrator.
    pub async fn run_once(&self, filters: &FilterState) -> Result<Snapshot, CollectError> {
        let (collection, options) = self.gather(filters).await?;
        let buckets = aggregate(&collection.records);
        let trends = forecast(&buckets);
        Ok(build_snapshot(0, filters.clone(), collection, options, buckets, trends))
    }
}

fn build_snapshot(
    generation: u64,
    filters: FilterState,
    collection: Collection,
    filter_options: Option<FilterOptions>,
    buckets: Vec<AggregateBucket>,
    trends: Vec<TrendModel>,
) -> Snapshot {
    Snapshot {
        generation,
        filters,
        buckets,
        trends,
        record_count: collection.records.len(),
        completeness: collection.completeness,
        filter_options,
        published_at: Utc::now(),
    }
}

struct Shared {
    state: PipelineState,
    generation: u64,
    /// Generation allowed to publish; cleared by any filter change.
    in_flight: Option<u64>,
    published: Option<Arc<Snapshot>>,
}

struct Inner {
    pipeline: Pipeline,
    shared: Mutex<Shared>,
    filters: watch::Sender<FilterState>,
    snapshots: broadcast::Sender<Arc<Snapshot>>,
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the settled filters and opens the next generation.
    fn begin_cycle(&self, filters_rx: &mut watch::Receiver<FilterState>) -> (u64, FilterState) {
        let mut shared = self.shared();
        let filters = filters_rx.borrow_and_update().clone();
        shared.generation += 1;
        shared.in_flight = Some(shared.generation);
        shared.state = PipelineState::Collecting;
        (shared.generation, filters)
    }

    fn advance(&self, generation: u64, state: PipelineState) {
        let mut shared = self.shared();
        if shared.in_flight == Some(generation) {
            shared.state = state;
        }
    }

    fn publish(&self, snapshot: Snapshot) {
        let generation = snapshot.generation;
        let mut shared = self.shared();
        if shared.in_flight != Some(generation) {
            debug!(generation, "discarding superseded cycle");
            return;
        }

        info!(
            generation,
            records = snapshot.record_count,
            buckets = snapshot.buckets.len(),
            trends = snapshot.trends.len(),
            completeness = %snapshot.completeness,
            "snapshot published"
        );
        let snapshot = Arc::new(snapshot);
        shared.published = Some(Arc::clone(&snapshot));
        // Err only means nobody is subscribed.
        let _ = self.snapshots.send(snapshot);
        shared.state = PipelineState::Published;
        shared.in_flight = None;
    }

    fn fail(&self, generation: u64, err: &CollectError) {
        let mut shared = self.shared();
        if shared.in_flight != Some(generation) {
            debug!(generation, error = %err, "superseded cycle failed");
            return;
        }
        warn!(generation, error = %err, "cycle failed, keeping previous snapshot");
        shared.state = PipelineState::Failed;
        shared.in_flight = None;
    }

    async fn run_cycle(&self, generation: u64, filters: FilterState) {
        info!(generation, %filters, "collecting");
        let (collection, options) = match self.pipeline.gather(&filters).await {
            Ok(gathered) => gathered,
            Err(err) => {
                self.fail(generation, &err);
                return;
            }
        };

        self.advance(generation, PipelineState::Aggregating);
        let buckets = aggregate(&collection.records);

        self.advance(generation, PipelineState::Forecasting);
        let trends = forecast(&buckets);

        self.publish(build_snapshot(
            generation, filters, collection, options, buckets, trends,
        ));
    }
}

async fn drive(inner: Arc<Inner>, mut filters_rx: watch::Receiver<FilterState>, debounce: Duration) {
    while filters_rx.changed().await.is_ok() {
        loop {
            match tokio::time::timeout(debounce, filters_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => break,
            }
        }

        let (generation, filters) = inner.begin_cycle(&mut filters_rx);
        let cycle = Arc::clone(&inner);
        tokio::spawn(async move { cycle.run_cycle(generation, filters).await });
    }
}

/// Owns the filter state and publishes the latest consistent [`Snapshot`].
///
/// Must be created inside a tokio runtime.
pub struct Orchestrator {
    inner: Arc<Inner>,
    driver: JoinHandle<()>,
}

impl Orchestrator {
    pub fn new(
        service: Arc<dyn EvaluationService>,
        scope: Option<ScopeConstraint>,
        config: PipelineConfig,
    ) -> Self {
        let initial = scope.as_ref().map(FilterState::scoped).unwrap_or_default();
        let debounce = config.debounce;
        let (filters, filters_rx) = watch::channel(initial);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_BUFFER);

        let inner = Arc::new(Inner {
            pipeline: Pipeline::new(service, scope, config),
            shared: Mutex::new(Shared {
                state: PipelineState::Idle,
                generation: 0,
                in_flight: None,
                published: None,
            }),
            filters,
            snapshots,
        });
        let driver = tokio::spawn(drive(Arc::clone(&inner), filters_rx, debounce));

        Self { inner, driver }
    }

    /// Replaces the selection at `facet`, clearing lower facets, and restarts the debounce window.
    pub fn on_filter_change<I, S>(&self, facet: Facet, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut shared = self.inner.shared();
        self.inner.filters.send_modify(|filters| filters.set(facet, values));
        shared.state = PipelineState::Debouncing;
        shared.in_flight = None;
    }

    /// Runs a new cycle for the unchanged filters.
    pub fn refresh(&self) {
        let mut shared = self.inner.shared();
        self.inner.filters.send_modify(|_| {});
        shared.state = PipelineState::Debouncing;
        shared.in_flight = None;
    }

    pub fn filters(&self) -> FilterState {
        self.inner.filters.borrow().clone()
    }

    pub fn state(&self) -> PipelineState {
        self.inner.shared().state
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.inner.shared().published.clone()
    }

    /// Every snapshot published after this call, in generation order.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.inner.snapshots.subscribe()
    }

    /// Calls `callback` with every snapshot published from now on.
    pub fn on_snapshot<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Arc<Snapshot>) + Send + 'static,
    {
        let mut snapshots = self.subscribe();
        tokio::spawn(async move {
            loop {
                match snapshots.recv().await {
                    Ok(snapshot) => callback(snapshot),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "snapshot listener fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time::{sleep, Instant};

    use crate::filters::FilterQuery;
    use crate::models::TrendSeries;
    use crate::service::{CsvEvaluationService, PageRequest, RecordPage};
    use crate::testing::record;

    /// In-memory service with per-cluster latency and a failure switch.
    struct SlowService {
        inner: CsvEvaluationService,
        delays: HashMap<&'static str, Duration>,
        options_delay: Duration,
        failing: AtomicBool,
        record_calls: AtomicUsize,
    }

    impl SlowService {
        fn new(delays: &[(&'static str, u64)]) -> Self {
            let records = ["slow", "fast", "steady"]
                .into_iter()
                .flat_map(|cluster| {
                    [
                        record(&format!("{cluster}-1"), cluster, "Western", 3, 1, 100.0),
                        record(&format!("{cluster}-2"), cluster, "Western", 6, 0, 140.0),
                        record(&format!("{cluster}-3"), cluster, "Western", 9, 1, 180.0),
                    ]
                })
                .collect();
            Self {
                inner: CsvEvaluationService::from_records(records),
                delays: delays
                    .iter()
                    .map(|(cluster, ms)| (*cluster, Duration::from_millis(*ms)))
                    .collect(),
                options_delay: Duration::from_millis(10),
                failing: AtomicBool::new(false),
                record_calls: AtomicUsize::new(0),
            }
        }

        fn delay_for(&self, query: &FilterQuery) -> Duration {
            query
                .iter()
                .find(|(name, _)| name == "cluster")
                .and_then(|(_, value)| self.delays.get(value.as_str()).copied())
                .unwrap_or(Duration::from_millis(10))
        }
    }

    #[async_trait]
    impl EvaluationService for SlowService {
        async fn fetch_records(
            &self,
            query: &FilterQuery,
            page: Option<PageRequest>,
        ) -> Result<RecordPage, ServiceError> {
            self.record_calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay_for(query)).await;
            if self.failing.load(Ordering::SeqCst) {
                return Err(ServiceError::Unavailable("switched off".to_string()));
            }
            self.inner.fetch_records(query, page).await
        }

        async fn fetch_filter_options(
            &self,
            query: &FilterQuery,
        ) -> Result<FilterOptions, ServiceError> {
            sleep(self.options_delay).await;
            self.inner.fetch_filter_options(query).await
        }
    }

    fn orchestrator(service: Arc<SlowService>) -> Orchestrator {
        Orchestrator::new(service, None, PipelineConfig::default())
    }

    fn cluster_of(snapshot: &Snapshot) -> Vec<String> {
        snapshot
            .filters
            .selected(Facet::Cluster)
            .iter()
            .cloned()
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn starts_idle_without_snapshot() {
        let orchestrator = orchestrator(Arc::new(SlowService::new(&[])));
        assert_eq!(orchestrator.state(), PipelineState::Idle);
        assert!(!orchestrator.is_loading());
        assert!(orchestrator.latest().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_changes_collapse_into_one_cycle() {
        let service = Arc::new(SlowService::new(&[]));
        let orchestrator = orchestrator(service.clone());

        for cluster in ["slow", "steady", "fast", "steady", "fast"] {
            orchestrator.on_filter_change(Facet::Cluster, [cluster]);
            assert!(orchestrator.is_loading());
            sleep(Duration::from_millis(100)).await;
        }
        sleep(Duration::from_secs(2)).await;

        assert_eq!(service.record_calls.load(Ordering::SeqCst), 1);
        let snapshot = orchestrator.latest().unwrap();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(cluster_of(&snapshot), vec!["fast"]);
        assert_eq!(snapshot.record_count, 3);
        assert_eq!(orchestrator.state(), PipelineState::Published);
        assert!(!orchestrator.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn slower_older_cycle_never_overwrites_newer_one() {
        let service = Arc::new(SlowService::new(&[("slow", 2_000), ("fast", 50)]));
        let orchestrator = orchestrator(service.clone());

        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let _listener = orchestrator.on_snapshot(move |snapshot| {
            sink.lock().unwrap().push(snapshot.generation);
        });

        orchestrator.on_filter_change(Facet::Cluster, ["slow"]);
        sleep(Duration::from_millis(400)).await;
        assert_eq!(orchestrator.state(), PipelineState::Collecting);

        orchestrator.on_filter_change(Facet::Cluster, ["fast"]);
        sleep(Duration::from_millis(400)).await;
        sleep(Duration::from_secs(5)).await;

        assert_eq!(service.record_calls.load(Ordering::SeqCst), 2);
        let snapshot = orchestrator.latest().unwrap();
        assert_eq!(snapshot.generation, 2);
        assert_eq!(cluster_of(&snapshot), vec!["fast"]);
        assert_eq!(*published.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn change_during_collection_discards_the_running_cycle() {
        let service = Arc::new(SlowService::new(&[("slow", 1_000)]));
        let orchestrator = Orchestrator::new(
            service.clone(),
            None,
            PipelineConfig::default().with_debounce_ms(2_000),
        );

        orchestrator.on_filter_change(Facet::Cluster, ["slow"]);
        sleep(Duration::from_millis(2_100)).await;
        orchestrator.on_filter_change(Facet::Cluster, ["steady"]);

        // The first cycle finishes while the second change is still debouncing.
        sleep(Duration::from_millis(1_500)).await;
        assert!(orchestrator.latest().is_none());
        assert_eq!(orchestrator.state(), PipelineState::Debouncing);

        sleep(Duration::from_secs(3)).await;
        let snapshot = orchestrator.latest().unwrap();
        assert_eq!(cluster_of(&snapshot), vec!["steady"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_keeps_previous_snapshot() {
        let service = Arc::new(SlowService::new(&[]));
        let orchestrator = orchestrator(service.clone());

        orchestrator.on_filter_change(Facet::Cluster, ["steady"]);
        sleep(Duration::from_secs(1)).await;
        let first = orchestrator.latest().unwrap();

        service.failing.store(true, Ordering::SeqCst);
        orchestrator.on_filter_change(Facet::Cluster, ["fast"]);
        sleep(Duration::from_secs(1)).await;

        assert_eq!(orchestrator.state(), PipelineState::Failed);
        assert!(!orchestrator.is_loading());
        let current = orchestrator.latest().unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(cluster_of(&current), vec!["steady"]);
    }

    #[tokio::test(start_paused = true)]
    async fn options_are_fetched_alongside_records() {
        let mut service = SlowService::new(&[("steady", 1_000)]);
        service.options_delay = Duration::from_millis(1_000);
        let orchestrator = orchestrator(Arc::new(service));
        let mut snapshots = orchestrator.subscribe();

        let started = Instant::now();
        orchestrator.on_filter_change(Facet::Cluster, ["steady"]);
        let snapshot = snapshots.recv().await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(1_800));
        assert!(Arc::ptr_eq(&snapshot, &orchestrator.latest().unwrap()));
        let options = snapshot.filter_options.as_ref().unwrap();
        assert_eq!(options.clusters, vec!["steady"]);
        assert_eq!(snapshot.buckets.len(), 3);
        assert!(snapshot.trend_for(&TrendSeries::Overall).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn scoped_session_never_sees_other_regions() {
        let service = Arc::new(SlowService::new(&[]));
        let scope = ScopeConstraint::new(Facet::Region, "Eastern");
        let orchestrator = Orchestrator::new(service, Some(scope), PipelineConfig::default());
        assert!(orchestrator.filters().selected(Facet::Region).contains("Eastern"));

        orchestrator.refresh();
        sleep(Duration::from_secs(2)).await;

        let snapshot = orchestrator.latest().unwrap();
        assert_eq!(snapshot.record_count, 0);
        assert!(snapshot.buckets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_receives_every_published_snapshot() {
        let service = Arc::new(SlowService::new(&[]));
        let orchestrator = orchestrator(service);
        let mut snapshots = orchestrator.subscribe();

        orchestrator.on_filter_change(Facet::Cluster, ["steady"]);
        sleep(Duration::from_secs(1)).await;
        orchestrator.on_filter_change(Facet::Cluster, ["fast"]);
        sleep(Duration::from_secs(1)).await;

        // Neither snapshot was read while both cycles ran.
        let first = snapshots.recv().await.unwrap();
        let second = snapshots.recv().await.unwrap();
        assert_eq!((first.generation, second.generation), (1, 2));
        assert_eq!(cluster_of(&first), vec!["steady"]);
        assert_eq!(cluster_of(&second), vec!["fast"]);
        assert!(snapshots.try_recv().is_err());
    }
}
