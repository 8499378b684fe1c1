//! Per-target liveness state machine.
//!
//! A worker owns one prober and derives `Unknown`/`Online`/`Offline` from probe
//! replies and two tickers:
//!
//! - the liveness ticker compares the last reply against the offline window and
//!   is the only path from `Online` to `Offline`;
//! - the heartbeat ticker re-announces the current status unchanged.
//!
//! Every handler runs under the worker's state lock, so transitions for one
//! target are totally ordered. The sink is called with that lock held.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, error, info, trace, warn};

use crate::models::{OnlineStatus, StatusUpdate, UpdateSource, WorkerSnapshot};
use crate::notify::NotificationSink;
use crate::prober::{ProbeError, ProbeEvent, ProberFactory};

const PROBE_EVENT_BUFFER: usize = 64;
const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub liveness_interval: Duration,
    pub offline_after: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(5),
            offline_after: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(600),
        }
    }
}

/// A prober that could not be built or stopped with an error.
#[derive(Debug, Error)]
#[error("worker {target}: {error}")]
pub struct WorkerFailure {
    pub target: String,
    #[source]
    pub error: ProbeError,
}

pub type FailureSender = mpsc::UnboundedSender<WorkerFailure>;

/// Status implied by the last successful probe at `now`.
pub fn liveness_status(last_seen: Option<Instant>, now: Instant, offline_after: Duration) -> OnlineStatus {
    match last_seen {
        None => OnlineStatus::Unknown,
        Some(at) if now < at + offline_after => OnlineStatus::Online,
        Some(_) => OnlineStatus::Offline,
    }
}

#[derive(Clone, Copy)]
struct LastSeen {
    at: Instant,
    wall: DateTime<Utc>,
}

struct WorkerState {
    status: OnlineStatus,
    last_seen: Option<LastSeen>,
    valid: bool,
    stopped: bool,
    completion: Option<TaskTrackerToken>,
}

struct WorkerCore {
    target: String,
    settings: WorkerSettings,
    sink: Arc<dyn NotificationSink>,
    failures: FailureSender,
    state: Mutex<WorkerState>,
}

impl WorkerCore {
    fn emit(&self, state: &WorkerState, source: UpdateSource) {
        self.sink.publish(&StatusUpdate {
            target: self.target.clone(),
            status: state.status,
            last_seen: state.last_seen.map(|seen| seen.wall),
            source,
        });
    }

    fn transition(&self, state: &mut WorkerState, status: OnlineStatus, source: UpdateSource) {
        if state.status == status {
            return;
        }
        match status {
            OnlineStatus::Unknown => debug!(addr = %self.target, ?source, "Status -> {}", status),
            _ => info!(addr = %self.target, ?source, "Status -> {}", status),
        }
        state.status = status;
        self.emit(state, source);
    }

    async fn on_probe_reply(&self, latency: Duration) {
        let mut state = self.state.lock().await;
        if state.stopped || !state.valid {
            return;
        }
        trace!(addr = %self.target, ?latency, "Echo reply");
        let now = Instant::now();
        if state.last_seen.map_or(true, |seen| now >= seen.at) {
            state.last_seen = Some(LastSeen { at: now, wall: Utc::now() });
        }
        self.transition(&mut state, OnlineStatus::Online, UpdateSource::ProbeSuccess);
    }

    async fn check_liveness(&self) {
        let mut state = self.state.lock().await;
        if state.stopped {
            return;
        }
        let status = liveness_status(
            state.last_seen.map(|seen| seen.at),
            Instant::now(),
            self.settings.offline_after,
        );
        self.transition(&mut state, status, UpdateSource::LivenessTimer);
    }

    async fn heartbeat(&self) {
        let state = self.state.lock().await;
        if state.stopped {
            return;
        }
        debug!(addr = %self.target, status = %state.status, "Heartbeat");
        self.emit(&state, UpdateSource::Heartbeat);
    }

    async fn mark_invalid(&self, error: ProbeError) {
        self.state.lock().await.valid = false;
        self.report(error);
    }

    fn report(&self, error: ProbeError) {
        error!(addr = %self.target, "Prober failed: {}", error);
        let failure = WorkerFailure {
            target: self.target.clone(),
            error,
        };
        if self.failures.send(failure).is_err() {
            warn!(addr = %self.target, "Failure stream closed");
        }
    }
}

pub struct Worker {
    core: Arc<WorkerCore>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_requested: AtomicBool,
}

impl Worker {
    /// Builds the prober and starts the background loops. A prober that cannot
    /// be built leaves the worker in place but invalid.
    pub(crate) fn spawn(
        target: &str,
        settings: WorkerSettings,
        factory: &dyn ProberFactory,
        sink: Arc<dyn NotificationSink>,
        failures: FailureSender,
        completion: TaskTrackerToken,
    ) -> Self {
        let prober = factory.build(target);
        let core = Arc::new(WorkerCore {
            target: target.to_string(),
            settings,
            sink,
            failures,
            state: Mutex::new(WorkerState {
                status: OnlineStatus::Unknown,
                last_seen: None,
                valid: prober.is_ok(),
                stopped: false,
                completion: Some(completion),
            }),
        });
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(4);

        tasks.push(spawn_ticker(cancel.clone(), settings.liveness_interval, {
            let core = Arc::clone(&core);
            move || {
                let core = Arc::clone(&core);
                async move { core.check_liveness().await }
            }
        }));
        tasks.push(spawn_ticker(cancel.clone(), settings.heartbeat_interval, {
            let core = Arc::clone(&core);
            move || {
                let core = Arc::clone(&core);
                async move { core.heartbeat().await }
            }
        }));

        match prober {
            Ok(prober) => {
                let (events_tx, events_rx) = mpsc::channel(PROBE_EVENT_BUFFER);
                tasks.push(tokio::spawn(receive_loop(
                    Arc::clone(&core),
                    events_rx,
                    cancel.clone(),
                )));
                let run_core = Arc::clone(&core);
                let run_cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = prober.run(events_tx, run_cancel).await {
                        run_core.mark_invalid(e).await;
                    }
                }));
            }
            Err(e) => core.report(e),
        }

        info!(addr = %target, "Worker created");
        Self {
            core,
            cancel,
            tasks: Mutex::new(tasks),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &str {
        &self.core.target
    }

    pub async fn status(&self) -> OnlineStatus {
        self.core.state.lock().await.status
    }

    pub async fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.core.state.lock().await.last_seen.map(|seen| seen.wall)
    }

    pub async fn is_valid(&self) -> bool {
        self.core.state.lock().await.valid
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        let state = self.core.state.lock().await;
        WorkerSnapshot {
            target: self.core.target.clone(),
            status: state.status,
            last_seen: state.last_seen.map(|seen| seen.wall),
            valid: state.valid,
            stopped: state.stopped,
        }
    }

    /// Runs one liveness evaluation now, as the liveness ticker does.
    pub async fn check_liveness(&self) {
        self.core.check_liveness().await;
    }

    /// Re-announces the current status now, as the heartbeat ticker does.
    pub async fn heartbeat(&self) {
        self.core.heartbeat().await;
    }

    /// Cancels the loops, waits for them to exit, forces `Unknown` and emits
    /// the final notification. Only the registry calls this.
    pub(crate) async fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            warn!(addr = %self.core.target, "Worker already stopped");
            return;
        }
        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(addr = %self.core.target, "Worker task panicked: {}", e);
                }
            }
        }

        let completion = {
            let mut state = self.core.state.lock().await;
            state.stopped = true;
            state.status = OnlineStatus::Unknown;
            self.core.emit(&state, UpdateSource::WorkerStop);
            state.completion.take()
        };
        drop(completion);
        info!(addr = %self.core.target, "Worker stopped");
    }
}

fn spawn_ticker<F, Fut>(cancel: CancellationToken, period: Duration, mut on_tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    // interval_at panics on a zero period
    let period = period.max(MIN_TICK_PERIOD);
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => on_tick().await,
            }
        }
    })
}

async fn receive_loop(core: Arc<WorkerCore>, mut events: mpsc::Receiver<ProbeEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(ProbeEvent::Reply { latency }) => core.on_probe_reply(latency).await,
            Some(ProbeEvent::Lost { sequence }) => {
                trace!(addr = %core.target, seq = sequence, "Echo lost");
            }
            None => break,
        }
    }
}
