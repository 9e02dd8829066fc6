//! Stuck/stale query repair and reconnect recovery.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::clock::now_millis;
use crate::config::RecoveryConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::observability::metrics;
use crate::recovery::probe::{HealthProbe, ProbeError};
use crate::recovery::store::{QueryRecord, QueryStore};

const EVENT_CAPACITY: usize = 16;

/// What observed the reconnect that led to a bulk recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryTrigger {
    Probe,
    Platform,
    Manual,
}

/// Emitted after every bulk recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub id: Uuid,
    pub trigger: RecoveryTrigger,
    pub recovered_queries: usize,
    /// Epoch milliseconds.
    pub at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryHealthReport {
    pub stuck_queries: usize,
    pub stale_queries: usize,
    pub total_recovered: usize,
}

struct Reachability {
    reachable: bool,
    pending: Option<JoinHandle<()>>,
}

fn age_exceeds(at: Option<u64>, now: u64, threshold: Duration) -> Option<bool> {
    at.map(|t| now.saturating_sub(t) > threshold.as_millis() as u64)
}

fn is_stuck(q: &QueryRecord, now: u64, threshold: Duration) -> bool {
    // An error without a timestamp has been there forever.
    q.error.is_some() && !q.is_fetching() && age_exceeds(q.error_updated_at, now, threshold).unwrap_or(true)
}

fn is_stale(q: &QueryRecord, now: u64, threshold: Duration) -> bool {
    age_exceeds(q.data_updated_at, now, threshold).unwrap_or(false)
}

/// Watches reachability and keeps the query store from getting stuck.
pub struct RecoveryCoordinator {
    queries: Arc<dyn QueryStore>,
    connectivity: ConnectivityMonitor,
    config: ArcSwap<RecoveryConfig>,
    probe: ArcSwap<HealthProbe>,
    state: Mutex<Reachability>,
    events: broadcast::Sender<RecoveryEvent>,
    reload: Notify,
}

impl RecoveryCoordinator {
    pub fn new(
        config: RecoveryConfig,
        queries: Arc<dyn QueryStore>,
        connectivity: ConnectivityMonitor,
    ) -> Result<Self, ProbeError> {
        let probe = HealthProbe::new(&config)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            queries,
            connectivity,
            config: ArcSwap::from_pointee(config),
            probe: ArcSwap::from_pointee(probe),
            state: Mutex::new(Reachability {
                reachable: true,
                pending: None,
            }),
            events,
            reload: Notify::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, Reachability> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap in new settings. A running loop rebuilds its timers.
    pub fn update_config(&self, config: RecoveryConfig) -> Result<(), ProbeError> {
        let probe = HealthProbe::new(&config)?;
        self.probe.store(Arc::new(probe));
        self.config.store(Arc::new(config));
        self.reload.notify_one();
        Ok(())
    }

    pub fn config(&self) -> Arc<RecoveryConfig> {
        self.config.load_full()
    }

    /// Receive an event after each bulk recovery.
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Last observed reachability of the gateway.
    pub fn is_reachable(&self) -> bool {
        self.lock_state().reachable
    }

    /// Reset then invalidate one query so its next fetch starts clean.
    pub fn recover_query(&self, key: &str) {
        self.queries.reset(key);
        self.queries.invalidate(key);
        tracing::debug!(key = %key, "Recovered query");
    }

    /// Recover errored queries whose error is older than the stuck threshold.
    pub fn recover_stuck_queries(&self) -> usize {
        let threshold = self.config.load().stuck_error_threshold();
        let now = now_millis();
        let stuck: Vec<QueryRecord> = self
            .queries
            .queries()
            .into_iter()
            .filter(|q| is_stuck(q, now, threshold))
            .collect();

        if !stuck.is_empty() {
            tracing::info!(count = stuck.len(), "Found stuck queries");
            for q in &stuck {
                self.recover_query(&q.key);
            }
            metrics::record_recovered_queries("stuck", stuck.len());
        }
        stuck.len()
    }

    /// Invalidate idle queries whose data is older than the staleness threshold.
    pub fn refresh_stale_queries(&self) -> usize {
        let threshold = self.config.load().stale_threshold();
        let now = now_millis();
        let stale: Vec<QueryRecord> = self
            .queries
            .queries()
            .into_iter()
            .filter(|q| !q.is_fetching() && is_stale(q, now, threshold))
            .collect();

        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "Found stale queries");
            for q in &stale {
                self.queries.invalidate(&q.key);
            }
            metrics::record_recovered_queries("stale", stale.len());
        }
        stale.len()
    }

    /// Run both sweeps once.
    pub fn perform_health_check(&self) -> QueryHealthReport {
        let stuck_queries = self.recover_stuck_queries();
        let stale_queries = self.refresh_stale_queries();
        QueryHealthReport {
            stuck_queries,
            stale_queries,
            total_recovered: stuck_queries + stale_queries,
        }
    }

    /// Force every errored or stale query to refetch, then refetch everything.
    pub fn recover_after_reconnect(&self, trigger: RecoveryTrigger) -> RecoveryEvent {
        let id = Uuid::new_v4();
        let threshold = self.config.load().stale_threshold();
        let now = now_millis();

        let targets: Vec<QueryRecord> = self
            .queries
            .queries()
            .into_iter()
            .filter(|q| (q.error.is_some() && !q.is_fetching()) || is_stale(q, now, threshold))
            .collect();

        for q in &targets {
            self.queries.reset(&q.key);
            self.queries.invalidate(&q.key);
            self.queries.refetch(&q.key);
        }
        self.queries.invalidate_all();
        self.queries.refetch_all();

        metrics::record_recovered_queries("reconnect", targets.len());
        tracing::info!(run = %id, ?trigger, recovered = targets.len(), "Reconnect recovery complete");

        let event = RecoveryEvent {
            id,
            trigger,
            recovered_queries: targets.len(),
            at: now_millis(),
        };
        let _ = self.events.send(event.clone());
        event
    }

    /// Feed a reachability observation.
    ///
    /// Any change cancels a pending recovery. A change to reachable schedules
    /// a new one after the stabilization delay.
    pub fn observe_reachability(self: &Arc<Self>, reachable: bool, trigger: RecoveryTrigger) {
        let mut state = self.lock_state();
        let was_reachable = std::mem::replace(&mut state.reachable, reachable);
        if was_reachable == reachable {
            return;
        }

        if let Some(pending) = state.pending.take() {
            pending.abort();
            tracing::debug!("Cancelled pending reconnect recovery");
        }

        if !reachable {
            tracing::warn!(?trigger, "Gateway unreachable");
            return;
        }

        let delay = self.config.load().stabilization_delay();
        tracing::info!(?trigger, delay_ms = delay.as_millis() as u64, "Gateway reachable again, scheduling recovery");

        let this = Arc::clone(self);
        state.pending = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            this.recover_after_reconnect(trigger);
        }));
    }

    /// Probe the gateway once and feed the result.
    pub async fn probe_once(self: &Arc<Self>) -> bool {
        let probe = self.probe.load_full();
        let reachable = probe.check(self.connectivity.is_online()).await;
        self.observe_reachability(reachable, RecoveryTrigger::Probe);
        reachable
    }

    fn cancel_pending(&self) {
        if let Some(pending) = self.lock_state().pending.take() {
            pending.abort();
        }
    }

    /// Drive probes, sweeps and platform events until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut platform = self.connectivity.subscribe();
        let mut timers = Timers::new(&self.config.load());

        tracing::info!(
            probe = %self.probe.load().url(),
            health_checks = timers.health.is_some(),
            stuck_sweep = timers.stuck.is_some(),
            stale_sweep = timers.stale.is_some(),
            "Recovery coordinator starting"
        );

        loop {
            tokio::select! {
                _ = Timers::tick(&mut timers.health) => {
                    self.probe_once().await;
                }
                _ = Timers::tick(&mut timers.stuck) => {
                    self.recover_stuck_queries();
                }
                _ = Timers::tick(&mut timers.stale) => {
                    self.refresh_stale_queries();
                }
                changed = platform.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *platform.borrow_and_update();
                    self.observe_reachability(online, RecoveryTrigger::Platform);
                }
                _ = self.reload.notified() => {
                    timers = Timers::new(&self.config.load());
                    tracing::info!("Recovery timers rebuilt after config reload");
                }
                _ = shutdown.recv() => {
                    tracing::info!("Recovery coordinator received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        self.cancel_pending();
    }
}

struct Timers {
    health: Option<Interval>,
    stuck: Option<Interval>,
    stale: Option<Interval>,
}

impl Timers {
    fn new(config: &RecoveryConfig) -> Self {
        Self {
            // Probe right away; sweeps wait one period.
            health: periodic(config.health_check_enabled, config.health_check_interval(), true),
            stuck: periodic(
                config.stuck_sweep_enabled,
                Duration::from_secs(config.stuck_sweep_interval_secs),
                false,
            ),
            stale: periodic(
                config.stale_sweep_enabled,
                Duration::from_secs(config.stale_sweep_interval_secs),
                false,
            ),
        }
    }

    async fn tick(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

fn periodic(enabled: bool, period: Duration, immediate: bool) -> Option<Interval> {
    if !enabled || period.is_zero() {
        return None;
    }
    let start = if immediate { Instant::now() } else { Instant::now() + period };
    let mut interval = time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use crate::recovery::store::{FetchStatus, MemoryQueryStore, StoreCall};

    const MIN: u64 = 60 * 1000;

    fn record(key: &str) -> QueryRecord {
        QueryRecord {
            key: key.to_string(),
            has_data: false,
            error: None,
            fetch_status: FetchStatus::Idle,
            data_updated_at: None,
            error_updated_at: None,
        }
    }

    fn errored(key: &str, error_at: Option<u64>, status: FetchStatus) -> QueryRecord {
        QueryRecord {
            error: Some("503".into()),
            error_updated_at: error_at,
            fetch_status: status,
            ..record(key)
        }
    }

    fn with_data(key: &str, at: u64, status: FetchStatus) -> QueryRecord {
        QueryRecord {
            has_data: true,
            data_updated_at: Some(at),
            fetch_status: status,
            ..record(key)
        }
    }

    fn quiet_config() -> RecoveryConfig {
        RecoveryConfig {
            health_check_enabled: false,
            stuck_sweep_enabled: false,
            stale_sweep_enabled: false,
            ..Default::default()
        }
    }

    fn coordinator(store: &Arc<MemoryQueryStore>) -> (Arc<RecoveryCoordinator>, ConnectivityMonitor) {
        let connectivity = ConnectivityMonitor::default();
        let coordinator = RecoveryCoordinator::new(quiet_config(), store.clone(), connectivity.clone()).unwrap();
        (Arc::new(coordinator), connectivity)
    }

    #[tokio::test]
    async fn test_stuck_sweep_selection() {
        let store = Arc::new(MemoryQueryStore::new());
        let now = now_millis();
        store.upsert(errored("old", Some(now - 10 * MIN), FetchStatus::Idle));
        store.upsert(errored("untimed", None, FetchStatus::Paused));
        store.upsert(errored("fetching", Some(now - 10 * MIN), FetchStatus::Fetching));
        store.upsert(errored("recent", Some(now - MIN), FetchStatus::Idle));
        store.upsert(with_data("healthy", now - 10 * MIN, FetchStatus::Idle));
        let (coordinator, _) = coordinator(&store);

        assert_eq!(coordinator.recover_stuck_queries(), 2);
        assert_eq!(
            store.take_calls(),
            vec![
                StoreCall::Reset("old".into()),
                StoreCall::Invalidate("old".into()),
                StoreCall::Reset("untimed".into()),
                StoreCall::Invalidate("untimed".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_sweep_invalidates_without_reset() {
        let store = Arc::new(MemoryQueryStore::new());
        let now = now_millis();
        store.upsert(with_data("old", now - 6 * MIN, FetchStatus::Idle));
        store.upsert(with_data("busy", now - 6 * MIN, FetchStatus::Fetching));
        store.upsert(with_data("fresh", now - MIN, FetchStatus::Idle));
        store.upsert(record("empty"));
        let (coordinator, _) = coordinator(&store);

        assert_eq!(coordinator.refresh_stale_queries(), 1);
        assert_eq!(store.take_calls(), vec![StoreCall::Invalidate("old".into())]);
    }

    #[tokio::test]
    async fn test_health_check_report() {
        let store = Arc::new(MemoryQueryStore::new());
        let now = now_millis();
        store.upsert(errored("stuck", None, FetchStatus::Idle));
        store.upsert(with_data("stale", now - 30 * MIN, FetchStatus::Idle));
        let (coordinator, _) = coordinator(&store);

        let report = coordinator.perform_health_check();
        assert_eq!(
            report,
            QueryHealthReport {
                stuck_queries: 1,
                stale_queries: 1,
                total_recovered: 2,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_for_stabilization() {
        let store = Arc::new(MemoryQueryStore::new());
        let now = now_millis();
        store.upsert(errored("errored", Some(now), FetchStatus::Idle));
        store.upsert(errored("in-flight", Some(now), FetchStatus::Fetching));
        store.upsert(with_data("stale", now - 6 * MIN, FetchStatus::Fetching));
        store.upsert(with_data("fresh", now, FetchStatus::Idle));
        let (coordinator, _) = coordinator(&store);
        let mut events = coordinator.subscribe();

        coordinator.observe_reachability(false, RecoveryTrigger::Probe);
        assert!(!coordinator.is_reachable());
        coordinator.observe_reachability(true, RecoveryTrigger::Probe);

        time::advance(Duration::from_millis(999)).await;
        tokio::task::yield_now().await;
        assert!(store.calls().is_empty());

        let event = events.recv().await.unwrap();
        assert_eq!(event.trigger, RecoveryTrigger::Probe);
        assert_eq!(event.recovered_queries, 2);
        assert_eq!(
            store.take_calls(),
            vec![
                StoreCall::Reset("errored".into()),
                StoreCall::Invalidate("errored".into()),
                StoreCall::Refetch("errored".into()),
                StoreCall::Reset("stale".into()),
                StoreCall::Invalidate("stale".into()),
                StoreCall::Refetch("stale".into()),
                StoreCall::InvalidateAll,
                StoreCall::RefetchAll,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_transition_cancels_pending_recovery() {
        let store = Arc::new(MemoryQueryStore::new());
        let (coordinator, _) = coordinator(&store);
        let mut events = coordinator.subscribe();

        coordinator.observe_reachability(false, RecoveryTrigger::Platform);
        coordinator.observe_reachability(true, RecoveryTrigger::Platform);
        time::advance(Duration::from_millis(500)).await;
        coordinator.observe_reachability(false, RecoveryTrigger::Platform);

        time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(store.calls().is_empty());

        // Repeated observations of the same state do nothing.
        coordinator.observe_reachability(false, RecoveryTrigger::Probe);
        coordinator.observe_reachability(true, RecoveryTrigger::Probe);
        coordinator.observe_reachability(true, RecoveryTrigger::Probe);

        let event = events.recv().await.unwrap();
        assert_eq!(event.recovered_queries, 0);
        assert_eq!(store.take_calls(), vec![StoreCall::InvalidateAll, StoreCall::RefetchAll]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reacts_to_platform_events_until_shutdown() {
        let store = Arc::new(MemoryQueryStore::new());
        let (coordinator, connectivity) = coordinator(&store);
        let mut events = coordinator.subscribe();
        let shutdown = Shutdown::new();

        let handle = tokio::spawn(coordinator.clone().run(shutdown.subscribe()));
        time::sleep(Duration::from_millis(10)).await;

        connectivity.set_online(false);
        time::sleep(Duration::from_millis(10)).await;
        assert!(!coordinator.is_reachable());

        connectivity.set_online(true);
        let event = events.recv().await.unwrap();
        assert_eq!(event.trigger, RecoveryTrigger::Platform);

        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_changes_delay() {
        let store = Arc::new(MemoryQueryStore::new());
        let (coordinator, _) = coordinator(&store);
        let mut events = coordinator.subscribe();

        coordinator
            .update_config(RecoveryConfig {
                stabilization_delay_ms: 5000,
                ..quiet_config()
            })
            .unwrap();
        assert_eq!(coordinator.config().stabilization_delay_ms, 5000);

        let start = Instant::now();
        coordinator.observe_reachability(false, RecoveryTrigger::Manual);
        coordinator.observe_reachability(true, RecoveryTrigger::Manual);
        events.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));

        let bad = RecoveryConfig {
            probe_base_url: "nope".into(),
            ..quiet_config()
        };
        assert!(coordinator.update_config(bad).is_err());
        assert_eq!(coordinator.config().stabilization_delay_ms, 5000);
    }
}
