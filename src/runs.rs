use crate::{
    catalog::{ScanOutcome, SkippedListing},
    models::StageReport,
    pipeline::{Pipeline, PipelineErrorKind, RunReport, SellerFailure},
    source::SellerScope,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::{collections::VecDeque, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    AuthRequired,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::AuthRequired => "auth_required",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunRecord {
    pub id: Uuid,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sellers_processed: usize,
    pub listings_scraped: usize,
    pub scans: Vec<ScanOutcome>,
    pub failures: Vec<SellerFailure>,
    /// Source records rejected before any seller scan.
    pub skipped: Vec<SkippedListing>,
    pub stages: Vec<StageReport>,
    pub error: Option<String>,
}

impl RunRecord {
    fn started(id: Uuid, trigger: RunTrigger) -> Self {
        Self {
            id,
            trigger,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            sellers_processed: 0,
            listings_scraped: 0,
            scans: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            stages: Vec::new(),
            error: None,
        }
    }

    fn absorb_report(&mut self, report: RunReport) {
        let RunReport {
            sellers_processed,
            listings_scraped,
            scans,
            failures,
            skipped,
            stages,
            aborted,
        } = report;
        self.status = match &aborted {
            Some(err) => match err.kind() {
                PipelineErrorKind::AuthRequired => RunStatus::AuthRequired,
                PipelineErrorKind::Cancelled => RunStatus::Cancelled,
                PipelineErrorKind::SourceUnavailable => RunStatus::Failed,
            },
            None if failures.is_empty() => RunStatus::Completed,
            None => RunStatus::Failed,
        };
        self.error = match aborted {
            Some(err) => Some(err.to_string()),
            None if failures.is_empty() => None,
            None => Some(format!("{} seller(s) failed", failures.len())),
        };
        self.sellers_processed = sellers_processed;
        self.listings_scraped = listings_scraped;
        self.scans = scans;
        self.failures = failures;
        self.skipped = skipped;
        self.stages = stages;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Status,
    Log,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub kind: RunEventKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl RunEvent {
    fn new(run_id: Uuid, kind: RunEventKind, message: impl Into<String>) -> Self {
        Self {
            run_id,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("a run is already in progress ({0})")]
    AlreadyRunning(Uuid),
}

struct ActiveRun {
    id: Uuid,
    cancel: CancellationToken,
}

struct CoordinatorState {
    active: Option<ActiveRun>,
    history: VecDeque<RunRecord>,
}

/// Owns the single active run. `start` is a guarded Idle -> Running transition;
/// a second start while running is rejected, never queued.
#[derive(Clone)]
pub struct RunCoordinator {
    pipeline: Pipeline,
    state: Arc<Mutex<CoordinatorState>>,
    events: broadcast::Sender<RunEvent>,
    active_id: Arc<watch::Sender<Option<Uuid>>>,
    history_limit: usize,
}

impl RunCoordinator {
    pub fn new(pipeline: Pipeline, history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        let (active_id, _) = watch::channel(None);
        Self {
            pipeline,
            state: Arc::new(Mutex::new(CoordinatorState {
                active: None,
                history: VecDeque::new(),
            })),
            events,
            active_id: Arc::new(active_id),
            history_limit: history_limit.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub async fn start(&self, trigger: RunTrigger, scope: SellerScope) -> Result<Uuid, RunError> {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock().await;
            if let Some(active) = &state.active {
                return Err(RunError::AlreadyRunning(active.id));
            }
            state.active = Some(ActiveRun {
                id,
                cancel: cancel.clone(),
            });
            state.history.push_front(RunRecord::started(id, trigger));
            state.history.truncate(self.history_limit);
        }
        self.active_id.send_replace(Some(id));

        info!(target = "catalog.runs", run_id = %id, trigger = ?trigger, "run_started");
        self.emit(id, RunEventKind::Status, format!("Starting run {id} ({trigger:?})"));

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.execute(id, scope, cancel).await;
        });
        Ok(id)
    }

    /// Requests cancellation of the active run; returns whether one was running.
    pub async fn stop(&self) -> bool {
        let state = self.state.lock().await;
        match &state.active {
            Some(active) => {
                active.cancel.cancel();
                info!(target = "catalog.runs", run_id = %active.id, "run_stop_requested");
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<Uuid> {
        *self.active_id.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.current().is_some()
    }

    /// Resolves once no run is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.active_id.subscribe();
        let _ = rx.wait_for(Option::is_none).await;
    }

    /// Most recent runs first.
    pub async fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    pub async fn run(&self, id: Uuid) -> Option<RunRecord> {
        let state = self.state.lock().await;
        state.history.iter().find(|run| run.id == id).cloned()
    }

    async fn execute(&self, id: Uuid, scope: SellerScope, cancel: CancellationToken) {
        let started = Instant::now();
        let events = self.events.clone();
        let report = self
            .pipeline
            .run(&scope, &cancel, move |line| {
                let _ = events.send(RunEvent::new(id, RunEventKind::Log, line));
            })
            .await;

        let status = {
            let mut state = self.state.lock().await;
            let status = match state.history.iter_mut().find(|run| run.id == id) {
                Some(record) => {
                    if let Some(err) = &report.aborted {
                        warn!(target = "catalog.runs", run_id = %id, stage = err.stage(), detail = err.detail(), "run_aborted");
                    }
                    record.absorb_report(report);
                    record.completed_at = Some(Utc::now());
                    record.status
                }
                // evicted from a very small history while running
                None => RunStatus::Failed,
            };
            state.active = None;
            status
        };
        self.active_id.send_replace(None);

        crate::metrics::run_finished(status.as_str(), started.elapsed().as_millis());
        if status == RunStatus::Completed {
            info!(target = "catalog.runs", run_id = %id, status = status.as_str(), "run_finished");
        } else {
            warn!(target = "catalog.runs", run_id = %id, status = status.as_str(), "run_finished");
        }
        self.emit(
            id,
            RunEventKind::Complete,
            format!("Run finished with status: {}", status.as_str()),
        );
    }

    fn emit(&self, id: Uuid, kind: RunEventKind, message: String) {
        // no subscribers is fine
        let _ = self.events.send(RunEvent::new(id, kind, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{RawListing, ReconcileSettings, Reconciler};
    use crate::enrich::NoopEnricher;
    use crate::source::{MockListingSource, SourceBatch, SourceError};
    use crate::store::MemoryCatalogStore;
    use std::time::Duration;

    fn listing(id: &str) -> RawListing {
        RawListing {
            id: id.into(),
            seller_phone: "1".into(),
            name: Some("iPhone 12".into()),
            ..RawListing::default()
        }
    }

    fn coordinator_with(source: MockListingSource, limit: usize) -> RunCoordinator {
        let store = Arc::new(MemoryCatalogStore::new());
        let pipeline = Pipeline::new(
            Arc::new(source),
            Arc::new(NoopEnricher),
            Reconciler::new(store, ReconcileSettings::default()),
            Vec::new(),
        );
        RunCoordinator::new(pipeline, limit)
    }

    fn slow_source() -> MockListingSource {
        let mut source = MockListingSource::new();
        source.expect_fetch().returning(|_, _| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(SourceBatch {
                listings: vec![listing("a")],
                ..SourceBatch::default()
            })
        });
        source
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_is_rejected_while_running() {
        let coordinator = coordinator_with(slow_source(), 10);

        let first = coordinator
            .start(RunTrigger::Manual, SellerScope::All)
            .await
            .expect("first run starts");
        let second = coordinator.start(RunTrigger::Scheduled, SellerScope::All).await;
        assert_eq!(second, Err(RunError::AlreadyRunning(first)));
        assert_eq!(coordinator.current(), Some(first));

        coordinator.wait_idle().await;
        let record = coordinator.run(first).await.expect("recorded");
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.listings_scraped, 1);
        assert_eq!(record.scans.len(), 1);
        assert_eq!(record.scans[0].batches, 1);
        assert_eq!(
            record.stages.first().map(|stage| stage.name.as_str()),
            Some("fetch_listings")
        );
        assert!(record.completed_at.is_some());
        assert!(!coordinator.is_running());

        let next = coordinator.start(RunTrigger::Manual, SellerScope::All).await;
        assert!(next.is_ok(), "coordinator returns to idle");
        coordinator.wait_idle().await;
    }

    #[tokio::test]
    async fn auth_prompt_is_reported_as_auth_required() {
        let mut source = MockListingSource::new();
        source
            .expect_fetch()
            .returning(|_, _| Err(SourceError::AuthRequired));
        let coordinator = coordinator_with(source, 10);
        let mut events = coordinator.subscribe();

        let id = coordinator
            .start(RunTrigger::Manual, SellerScope::All)
            .await
            .expect("starts");
        coordinator.wait_idle().await;

        let record = coordinator.run(id).await.expect("recorded");
        assert_eq!(record.status, RunStatus::AuthRequired);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&RunEventKind::Status));
        assert_eq!(kinds.last(), Some(&RunEventKind::Complete));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_cancels_the_active_run() {
        let mut source = MockListingSource::new();
        source.expect_fetch().returning(|_, _| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(SourceBatch {
                listings: vec![listing("a")],
                ..SourceBatch::default()
            })
        });
        let coordinator = coordinator_with(source, 10);
        assert!(!coordinator.stop().await, "nothing to stop when idle");

        let id = coordinator
            .start(RunTrigger::Manual, SellerScope::All)
            .await
            .expect("starts");
        assert!(coordinator.stop().await);
        coordinator.wait_idle().await;

        let record = coordinator.run(id).await.expect("recorded");
        assert_eq!(record.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn history_is_bounded_and_newest_first() {
        let mut source = MockListingSource::new();
        source
            .expect_fetch()
            .returning(|_, _| Ok(SourceBatch::default()));
        let coordinator = coordinator_with(source, 2);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                coordinator
                    .start(RunTrigger::Scheduled, SellerScope::All)
                    .await
                    .expect("starts"),
            );
            coordinator.wait_idle().await;
        }

        let runs = coordinator.runs().await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, ids[2]);
        assert_eq!(runs[1].id, ids[1]);
        assert!(coordinator.run(ids[0]).await.is_none());
    }
}
