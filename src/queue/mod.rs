//! Test run queue
//!
//! Singleton FIFO scheduler with admission control: global concurrency,
//! per-project concurrency, and Android resource feasibility. Owns every
//! lifecycle transition (`QUEUED → PREPARING → RUNNING → terminal`),
//! buffers and flushes run events, and handles cancellation at any stage.
//!
//! A single reentrancy guard serializes the selection loop: a `process_next`
//! arriving while one is running sets a flag that causes exactly one re-run
//! when the active pass finishes. Queue state mutates only inside the
//! guarded region or inside `cancel`, which takes the same lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::device_pool::{DeviceManager, DeviceSelector};
use crate::error::{CANCELLED_BY_USER, ORPHANED_RUN, SERVER_RESTARTED};
use crate::events::{EventBus, ProjectEvent, RunEvent, RunStatus};
use crate::executor::types::{CleanupHandle, RunHooks};
use crate::executor::{ResolvedRunConfig, RunExecutor};
use crate::repository::{Repository, TerminalUpdate};
use crate::runtime::CancelToken;
use crate::usage::UsageService;

struct Job {
    run_id: String,
    config: Arc<ResolvedRunConfig>,
    token: CancelToken,
}

type CleanupSlot = Arc<parking_lot::Mutex<Option<CleanupHandle>>>;

struct RunningJob {
    token: CancelToken,
    cleanup: CleanupSlot,
    project_id: String,
    test_case_id: String,
    user_id: Option<String>,
    emulator_profiles: Vec<String>,
}

struct RunBuffer {
    events: Vec<RunEvent>,
    screenshots: usize,
    persisted_index: usize,
    last_flush: Instant,
    flush_scheduled: bool,
}

impl RunBuffer {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            screenshots: 0,
            persisted_index: 0,
            last_flush: Instant::now(),
            flush_scheduled: false,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    running: HashMap<String, RunningJob>,
    /// `run_id -> (project_id, PREPARING | RUNNING)`.
    active_statuses: HashMap<String, (String, RunStatus)>,
    cancel_requested: HashSet<String>,
    /// Android requests reserved for jobs started but not yet `RUNNING`.
    pending_reservations: HashMap<String, Vec<DeviceSelector>>,
    processing: bool,
    rerun_requested: bool,
    poll_timer_armed: bool,
}

/// The scheduler. One instance owns all runs in the process.
pub struct TestQueue {
    config: Arc<OrchestratorConfig>,
    repository: Arc<dyn Repository>,
    device_manager: Arc<DeviceManager>,
    executor: Arc<RunExecutor>,
    event_bus: Arc<EventBus>,
    usage: Arc<dyn UsageService>,
    state: tokio::sync::Mutex<QueueState>,
    buffers: parking_lot::Mutex<HashMap<String, RunBuffer>>,
}

impl TestQueue {
    #[must_use]
    pub fn new(
        config: Arc<OrchestratorConfig>,
        repository: Arc<dyn Repository>,
        device_manager: Arc<DeviceManager>,
        executor: Arc<RunExecutor>,
        event_bus: Arc<EventBus>,
        usage: Arc<dyn UsageService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            repository,
            device_manager,
            executor,
            event_bus,
            usage,
            state: tokio::sync::Mutex::new(QueueState::default()),
            buffers: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue a run. The persisted row must already exist; this resets the
    /// event buffer, persists `QUEUED`, publishes, and triggers a cycle.
    pub async fn add(self: &Arc<Self>, run_id: &str, config: ResolvedRunConfig) {
        let config = Arc::new(config);
        let token = CancelToken::new();
        {
            let mut state = self.state.lock().await;
            state.pending.push_back(Job {
                run_id: run_id.to_string(),
                config: Arc::clone(&config),
                token,
            });
        }
        self.buffers
            .lock()
            .insert(run_id.to_string(), RunBuffer::new());

        if let Err(e) = self.repository.update_run_status(run_id, RunStatus::Queued).await {
            error!(run_id, "failed to persist QUEUED: {e}");
        }
        if let Err(e) = self
            .repository
            .update_test_case_status(&config.test_case_id, RunStatus::Queued)
            .await
        {
            error!(run_id, "failed to update test case status: {e}");
        }
        self.publish_status(&config.project_id, &config.test_case_id, run_id, RunStatus::Queued);
        info!(run_id, project_id = %config.project_id, "run queued");
        self.trigger();
    }

    /// Kick a selection cycle. Cheap; safe to call from anywhere.
    pub fn trigger(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.process_next().await;
        });
    }

    /// The reentrancy-guarded selection loop.
    fn process_next(self: &Arc<Self>) -> futures::future::BoxFuture<'_, ()> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().await;
                if state.processing {
                    state.rerun_requested = true;
                    return;
                }
                state.processing = true;
            }

            loop {
                self.selection_pass().await;

                let mut state = self.state.lock().await;
                if state.rerun_requested {
                    state.rerun_requested = false;
                    drop(state);
                    continue;
                }

                // Jobs remain but none started: retry after the poll interval.
                if !state.pending.is_empty() && !state.poll_timer_armed {
                    state.poll_timer_armed = true;
                    let queue = Arc::clone(self);
                    let interval = self.config.poll_interval;
                    tokio::spawn(async move {
                        tokio::time::sleep(interval).await;
                        queue.state.lock().await.poll_timer_armed = false;
                        queue.process_next().await;
                    });
                }
                state.processing = false;
                break;
            }
        })
    }

    /// Scan the pending list in FIFO order and start every job that passes
    /// admission control, until none remain or the global ceiling is hit.
    async fn selection_pass(self: &Arc<Self>) {
        let mut not_startable: HashSet<String> = HashSet::new();

        loop {
            // Cheap checks under the lock; the device feasibility check is
            // async and runs with the lock released.
            let candidate = {
                let state = self.state.lock().await;
                if state.running.len() >= self.config.global_concurrency {
                    None
                } else {
                    state
                        .pending
                        .iter()
                        .find(|job| {
                            !not_startable.contains(&job.run_id)
                                && self.active_for_project(&state, &job.config.project_id)
                                    < self.config.max_concurrent_per_project
                        })
                        .map(|job| (job.run_id.clone(), job.config.android_selectors()))
                }
            };
            let Some((run_id, selectors)) = candidate else {
                break;
            };

            let feasible = if selectors.is_empty() {
                true
            } else {
                let mut batch: Vec<DeviceSelector> = {
                    let state = self.state.lock().await;
                    state
                        .pending_reservations
                        .values()
                        .flat_map(|v| v.iter().cloned())
                        .collect()
                };
                batch.extend(selectors);
                self.device_manager.can_acquire_batch_immediately(&batch).await
            };
            if !feasible {
                // Stays at its queue position; retried next cycle or poll.
                debug!(run_id, "job blocked on device availability");
                not_startable.insert(run_id);
                continue;
            }

            // Re-take the lock and claim the job if conditions still hold.
            let job = {
                let mut state = self.state.lock().await;
                let position = state.pending.iter().position(|job| job.run_id == run_id);
                match position {
                    Some(index)
                        if state.running.len() < self.config.global_concurrency
                            && self.active_for_project(
                                &state,
                                &state.pending[index].config.project_id,
                            ) < self.config.max_concurrent_per_project =>
                    {
                        state.pending.remove(index)
                    }
                    _ => None,
                }
            };
            if let Some(job) = job {
                self.start_job(job).await;
            } else {
                not_startable.insert(run_id);
            }
        }
    }

    fn active_for_project(&self, state: &QueueState, project_id: &str) -> usize {
        state
            .active_statuses
            .values()
            .filter(|(project, status)| project == project_id && status.is_active())
            .count()
    }

    async fn start_job(self: &Arc<Self>, job: Job) {
        let run_id = job.run_id.clone();
        let config = Arc::clone(&job.config);
        let token = job.token.clone();
        let cleanup: CleanupSlot = Arc::new(parking_lot::Mutex::new(None));

        let cancelled_in_window = {
            let mut state = self.state.lock().await;
            state.running.insert(
                run_id.clone(),
                RunningJob {
                    token: token.clone(),
                    cleanup: Arc::clone(&cleanup),
                    project_id: config.project_id.clone(),
                    test_case_id: config.test_case_id.clone(),
                    user_id: config.user_id.clone(),
                    emulator_profiles: config.emulator_profiles(),
                },
            );
            state.active_statuses.insert(
                run_id.clone(),
                (config.project_id.clone(), RunStatus::Preparing),
            );
            state
                .pending_reservations
                .insert(run_id.clone(), config.android_selectors());
            state.cancel_requested.contains(&run_id) || token.is_cancelled()
        };

        if cancelled_in_window {
            self.abort_before_execution(&run_id, &config).await;
            return;
        }

        // Conditional: a row the user cancelled while we were selecting
        // stays cancelled and the job never executes.
        let applied = match self
            .repository
            .update_run_status(&run_id, RunStatus::Preparing)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                error!(run_id, "failed to persist PREPARING: {e}");
                false
            }
        };
        if !applied || token.is_cancelled() {
            self.abort_before_execution(&run_id, &config).await;
            return;
        }
        self.publish_status(
            &config.project_id,
            &config.test_case_id,
            &run_id,
            RunStatus::Preparing,
        );
        info!(run_id, "run starting");

        let queue = Arc::clone(self);
        let hooks = self.build_hooks(&run_id, &config, Arc::clone(&cleanup));
        tokio::spawn(async move {
            let outcome = queue.executor.run(config, token, hooks).await;
            queue.finish_job(&run_id, outcome.status, outcome.error, outcome.action_count).await;
        });
    }

    /// Roll back `start_job` bookkeeping for a job that must not execute.
    async fn abort_before_execution(self: &Arc<Self>, run_id: &str, config: &ResolvedRunConfig) {
        debug!(run_id, "cancelled in the start window, skipping execution");
        let result_json = self.take_buffer_json(run_id);
        let applied = self
            .repository
            .update_run_terminal(
                run_id,
                TerminalUpdate {
                    status: RunStatus::Cancelled,
                    error: Some(CANCELLED_BY_USER.to_string()),
                    result_json,
                    logs_cleared: true,
                    completed_at: Utc::now(),
                },
            )
            .await
            .unwrap_or(false);
        if applied {
            let _ = self
                .repository
                .update_test_case_status(&config.test_case_id, RunStatus::Cancelled)
                .await;
            self.publish_terminal(
                &config.project_id,
                &config.test_case_id,
                run_id,
                RunStatus::Cancelled,
                Some(CANCELLED_BY_USER.to_string()),
            );
        }
        {
            let mut state = self.state.lock().await;
            state.running.remove(run_id);
            state.active_statuses.remove(run_id);
            state.pending_reservations.remove(run_id);
            state.cancel_requested.remove(run_id);
        }
        self.trigger();
    }

    fn build_hooks(
        self: &Arc<Self>,
        run_id: &str,
        config: &Arc<ResolvedRunConfig>,
        cleanup: CleanupSlot,
    ) -> RunHooks {
        let on_event = {
            let queue = Arc::clone(self);
            let run_id = run_id.to_string();
            Arc::new(move |event: RunEvent| {
                queue.append_event(&run_id, event);
            })
        };

        let on_preparing = {
            let queue = Arc::clone(self);
            let run_id = run_id.to_string();
            let project_id = config.project_id.clone();
            Arc::new(move || {
                let queue = Arc::clone(&queue);
                let run_id = run_id.clone();
                let project_id = project_id.clone();
                Box::pin(async move {
                    // No-op when the job is already PREPARING, which it is
                    // on every path through start_job.
                    let mut state = queue.state.lock().await;
                    state
                        .active_statuses
                        .entry(run_id)
                        .or_insert((project_id, RunStatus::Preparing));
                }) as futures::future::BoxFuture<'static, ()>
            })
        };

        let on_running = {
            let queue = Arc::clone(self);
            let run_id = run_id.to_string();
            let project_id = config.project_id.clone();
            let test_case_id = config.test_case_id.clone();
            Arc::new(move || {
                let queue = Arc::clone(&queue);
                let run_id = run_id.clone();
                let project_id = project_id.clone();
                let test_case_id = test_case_id.clone();
                Box::pin(async move {
                    {
                        let mut state = queue.state.lock().await;
                        // The leases are held now; the reservation no longer
                        // gates other jobs.
                        state.pending_reservations.remove(&run_id);
                        state
                            .active_statuses
                            .insert(run_id.clone(), (project_id.clone(), RunStatus::Running));
                    }
                    match queue.repository.update_run_status(&run_id, RunStatus::Running).await {
                        Ok(true) => queue.publish_status(
                            &project_id,
                            &test_case_id,
                            &run_id,
                            RunStatus::Running,
                        ),
                        Ok(false) => debug!(run_id, "RUNNING skipped, row already terminal"),
                        Err(e) => error!(run_id, "failed to persist RUNNING: {e}"),
                    }
                    queue.trigger();
                }) as futures::future::BoxFuture<'static, ()>
            })
        };

        let on_cleanup = {
            Arc::new(move |handle: CleanupHandle| {
                *cleanup.lock() = Some(handle);
            })
        };

        RunHooks {
            on_event,
            on_preparing,
            on_running,
            on_cleanup,
        }
    }

    /// Append an executor event to the run buffer and fan it out.
    ///
    /// Drop-on-overflow: past the event cap (or the screenshot sub-cap)
    /// the executor proceeds but nothing more is appended.
    fn append_event(self: &Arc<Self>, run_id: &str, event: RunEvent) {
        let schedule_flush = {
            let mut buffers = self.buffers.lock();
            let Some(buffer) = buffers.get_mut(run_id) else {
                return;
            };
            if buffer.events.len() >= self.config.max_events_per_run {
                return;
            }
            if event.is_screenshot() {
                if buffer.screenshots >= self.config.max_screenshots_per_run {
                    return;
                }
                buffer.screenshots += 1;
            }
            buffer.events.push(event.clone());
            if buffer.flush_scheduled {
                false
            } else {
                buffer.flush_scheduled = true;
                true
            }
        };

        self.event_bus.publish_run_event(run_id, event);

        if schedule_flush {
            let queue = Arc::clone(self);
            let run_id = run_id.to_string();
            let interval = self.config.flush_interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                queue.flush_run_logs(&run_id).await;
            });
        }
    }

    /// Append newly buffered events to the run's `logs` column as
    /// newline-delimited JSON.
    async fn flush_run_logs(&self, run_id: &str) {
        let chunk = {
            let mut buffers = self.buffers.lock();
            let Some(buffer) = buffers.get_mut(run_id) else {
                return;
            };
            buffer.flush_scheduled = false;
            if buffer.persisted_index >= buffer.events.len() {
                None
            } else {
                let mut chunk = String::new();
                for event in &buffer.events[buffer.persisted_index..] {
                    match serde_json::to_string(event) {
                        Ok(line) => {
                            chunk.push_str(&line);
                            chunk.push('\n');
                        }
                        Err(e) => warn!(run_id, "failed to serialize event: {e}"),
                    }
                }
                buffer.persisted_index = buffer.events.len();
                buffer.last_flush = Instant::now();
                Some(chunk)
            }
        };
        if let Some(chunk) = chunk {
            if let Err(e) = self.repository.append_run_logs(run_id, &chunk).await {
                warn!(run_id, "incremental log flush failed: {e}");
            }
        }
    }

    /// Serialize and drop the run's buffer. The result is the final event
    /// array in insertion order.
    fn take_buffer_json(&self, run_id: &str) -> String {
        let events = self
            .buffers
            .lock()
            .remove(run_id)
            .map(|buffer| buffer.events)
            .unwrap_or_default();
        serde_json::to_string(&events).unwrap_or_else(|_| "[]".to_string())
    }

    async fn finish_job(
        self: &Arc<Self>,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
        action_count: u64,
    ) {
        let entry = {
            let mut state = self.state.lock().await;
            let entry = state.running.remove(run_id);
            state.active_statuses.remove(run_id);
            state.pending_reservations.remove(run_id);
            state.cancel_requested.remove(run_id);
            entry
        };
        let Some(entry) = entry else {
            // The cancel path already finalized this run.
            self.buffers.lock().remove(run_id);
            self.trigger();
            return;
        };

        let result_json = self.take_buffer_json(run_id);
        let applied = match self
            .repository
            .update_run_terminal(
                run_id,
                TerminalUpdate {
                    status,
                    error: error.clone(),
                    result_json,
                    logs_cleared: true,
                    completed_at: Utc::now(),
                },
            )
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                error!(run_id, "failed to persist terminal state: {e}");
                false
            }
        };

        if applied {
            if let Err(e) = self
                .repository
                .update_test_case_status(&entry.test_case_id, status)
                .await
            {
                error!(run_id, "failed to update test case status: {e}");
            }
            self.publish_terminal(&entry.project_id, &entry.test_case_id, run_id, status, error);
        }

        self.record_usage_async(run_id, &entry, action_count);
        info!(run_id, %status, "run finalized");
        self.trigger();
    }

    /// Record action usage, best-effort and off the critical path.
    fn record_usage_async(self: &Arc<Self>, run_id: &str, entry: &RunningJob, action_count: u64) {
        let Some(user_id) = entry.user_id.clone() else {
            return;
        };
        if action_count == 0 {
            return;
        }
        let queue = Arc::clone(self);
        let run_id = run_id.to_string();
        let test_case_id = entry.test_case_id.clone();
        tokio::spawn(async move {
            let description = match queue
                .repository
                .find_test_case_with_project_for_run(&run_id)
                .await
            {
                Ok(Some(info)) => format!("{} - {}", info.project_name, info.test_case_name),
                _ => test_case_id,
            };
            if let Err(e) = queue
                .usage
                .record_usage(&user_id, action_count, &description, &run_id)
                .await
            {
                warn!(run_id, "usage recording failed: {e}");
            }
        });
    }

    /// Cancel a run wherever it is: running, queued, or orphaned.
    /// Idempotent; cancelling a terminal run is a no-op.
    pub async fn cancel(self: &Arc<Self>, run_id: &str, error_message: Option<&str>) {
        enum Found {
            Running {
                token: CancelToken,
                cleanup: CleanupSlot,
                project_id: String,
                test_case_id: String,
                emulator_profiles: Vec<String>,
            },
            Queued {
                project_id: String,
                test_case_id: String,
            },
            Unknown,
        }

        let found = {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.running.get(run_id) {
                let found = Found::Running {
                    token: entry.token.clone(),
                    cleanup: Arc::clone(&entry.cleanup),
                    project_id: entry.project_id.clone(),
                    test_case_id: entry.test_case_id.clone(),
                    emulator_profiles: entry.emulator_profiles.clone(),
                };
                state.cancel_requested.insert(run_id.to_string());
                found
            } else if let Some(index) = state.pending.iter().position(|job| job.run_id == run_id)
            {
                let job = state.pending.remove(index);
                match job {
                    Some(job) => Found::Queued {
                        project_id: job.config.project_id.clone(),
                        test_case_id: job.config.test_case_id.clone(),
                    },
                    None => Found::Unknown,
                }
            } else {
                Found::Unknown
            }
        };

        let message = error_message.unwrap_or(CANCELLED_BY_USER).to_string();

        match found {
            Found::Running {
                token,
                cleanup,
                project_id,
                test_case_id,
                emulator_profiles,
            } => {
                info!(run_id, "cancelling running run");
                // Abort before any cleanup runs.
                token.cancel();
                let handle = cleanup.lock().take();
                if let Some(handle) = handle {
                    handle.run().await;
                }

                let result_json = self.take_buffer_json(run_id);
                let applied = self
                    .repository
                    .update_run_terminal(
                        run_id,
                        TerminalUpdate {
                            status: RunStatus::Cancelled,
                            error: Some(message.clone()),
                            result_json,
                            logs_cleared: true,
                            completed_at: Utc::now(),
                        },
                    )
                    .await
                    .unwrap_or(false);
                if applied {
                    let _ = self
                        .repository
                        .update_test_case_status(&test_case_id, RunStatus::Cancelled)
                        .await;
                    self.publish_terminal(
                        &project_id,
                        &test_case_id,
                        run_id,
                        RunStatus::Cancelled,
                        Some(message),
                    );
                }

                // Don't strand warm emulators this job reserved.
                if !emulator_profiles.is_empty() {
                    self.device_manager
                        .stop_idle_emulators_for_profiles(&emulator_profiles)
                        .await;
                }

                {
                    let mut state = self.state.lock().await;
                    state.running.remove(run_id);
                    state.active_statuses.remove(run_id);
                    state.pending_reservations.remove(run_id);
                    state.cancel_requested.remove(run_id);
                }
                self.trigger();
            }
            Found::Queued {
                project_id,
                test_case_id,
            } => {
                info!(run_id, "cancelling queued run");
                let result_json = self.take_buffer_json(run_id);
                let applied = self
                    .repository
                    .update_run_terminal(
                        run_id,
                        TerminalUpdate {
                            status: RunStatus::Cancelled,
                            error: Some(message.clone()),
                            result_json,
                            logs_cleared: true,
                            completed_at: Utc::now(),
                        },
                    )
                    .await
                    .unwrap_or(false);
                if applied {
                    let _ = self
                        .repository
                        .update_test_case_status(&test_case_id, RunStatus::Cancelled)
                        .await;
                    self.publish_terminal(
                        &project_id,
                        &test_case_id,
                        run_id,
                        RunStatus::Cancelled,
                        Some(message),
                    );
                }
                self.trigger();
            }
            Found::Unknown => {
                // Only force-mark rows that are still active in persistence.
                let applied = self
                    .repository
                    .update_run_terminal(
                        run_id,
                        TerminalUpdate {
                            status: RunStatus::Cancelled,
                            error: Some(ORPHANED_RUN.to_string()),
                            result_json: "[]".to_string(),
                            logs_cleared: true,
                            completed_at: Utc::now(),
                        },
                    )
                    .await
                    .unwrap_or(false);
                if applied {
                    warn!(run_id, "force-cancelled orphaned run");
                    if let Ok(Some(info)) = self
                        .repository
                        .find_test_case_with_project_for_run(run_id)
                        .await
                    {
                        let _ = self
                            .repository
                            .update_test_case_status(&info.test_case_id, RunStatus::Cancelled)
                            .await;
                        self.publish_terminal(
                            &info.project_id,
                            &info.test_case_id,
                            run_id,
                            RunStatus::Cancelled,
                            Some(ORPHANED_RUN.to_string()),
                        );
                    }
                }
            }
        }
    }

    /// Startup reconciliation: every run still active in persistence is
    /// rewritten to `FAIL`, along with its test case.
    pub async fn startup(&self) -> anyhow::Result<()> {
        let stale = self.repository.find_stale_active_runs().await?;
        for run in stale {
            warn!(run_id = %run.run_id, status = %run.status, "reconciling stale run");
            let _ = self
                .repository
                .update_run_terminal(
                    &run.run_id,
                    TerminalUpdate {
                        status: RunStatus::Fail,
                        error: Some(SERVER_RESTARTED.to_string()),
                        result_json: "[]".to_string(),
                        logs_cleared: true,
                        completed_at: Utc::now(),
                    },
                )
                .await;
            let _ = self
                .repository
                .update_test_case_status(&run.test_case_id, RunStatus::Fail)
                .await;
        }
        Ok(())
    }

    /// Abort every running job with an infrastructure error. Pending jobs
    /// are left for startup reconciliation.
    pub async fn shutdown(self: &Arc<Self>) {
        let run_ids: Vec<String> = {
            let state = self.state.lock().await;
            state.running.keys().cloned().collect()
        };
        for run_id in run_ids {
            self.cancel(&run_id, Some("Server shutting down")).await;
        }
    }

    /// Buffered events for a run, in insertion order.
    #[must_use]
    pub fn get_events(&self, run_id: &str) -> Vec<RunEvent> {
        self.buffers
            .lock()
            .get(run_id)
            .map(|buffer| buffer.events.clone())
            .unwrap_or_default()
    }

    /// In-memory status: QUEUED while pending, PREPARING/RUNNING while
    /// active, `None` once terminal (persistence is the source of truth).
    pub async fn get_status(&self, run_id: &str) -> Option<RunStatus> {
        let state = self.state.lock().await;
        if let Some((_, status)) = state.active_statuses.get(run_id) {
            return Some(*status);
        }
        if state.pending.iter().any(|job| job.run_id == run_id) {
            return Some(RunStatus::Queued);
        }
        None
    }

    /// Number of jobs currently running (PREPARING or RUNNING).
    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    /// Number of jobs waiting in the queue.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    fn publish_status(
        &self,
        project_id: &str,
        test_case_id: &str,
        run_id: &str,
        status: RunStatus,
    ) {
        self.event_bus.publish_project_event(
            project_id,
            ProjectEvent::test_run_status(project_id, test_case_id, run_id, status),
        );
    }

    /// Terminal states publish on both the project topic and the run topic.
    fn publish_terminal(
        &self,
        project_id: &str,
        test_case_id: &str,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) {
        self.publish_status(project_id, test_case_id, run_id, status);
        self.event_bus
            .publish_run_event(run_id, RunEvent::status(status, error));
    }
}

impl std::fmt::Debug for TestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestQueue").finish_non_exhaustive()
    }
}