// Upload orchestration: push the selected scratch files to
// `<folder>/<date>/<relative path>`, a few at a time, retrying each file a
// bounded number of times, and decide what happens to the session after.

use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::collector::CandidateFile;
use crate::config::UploadSettings;
use crate::error::{Error, Result};
use crate::remote::{join_relative, ByteSink, RemoteStorage, Transfer};
use crate::workspace::{SessionState, WorkspaceSession};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

#[derive(Serialize, Debug, Clone)]
pub struct UploadTask {
    pub candidate: CandidateFile,
    /// `<folder>/<date>/<relative path>`, as the user will find it.
    pub remote_target_path: String,
    pub status: TaskStatus,
    pub bytes_transferred: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl UploadTask {
    /// Path below the remote folder handed to the backend.
    fn backend_path(&self, date: &str) -> String {
        format!("{date}/{}", self.candidate.relative_path)
    }

    // Zero-byte files still count for something in the progress total.
    fn weight(&self) -> u64 {
        self.candidate.size_bytes.max(1)
    }
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    FileStarted { path: String, attempt: u32 },
    /// Aggregate progress; never smaller than the previous one sent.
    Progress { transferred: u64, total: u64 },
    FileDone { path: String },
    FileFailed { path: String, attempt: u32, error: String, will_retry: bool },
}

impl ProgressEvent {
    pub fn fraction(transferred: u64, total: u64) -> f64 {
        if total == 0 {
            1.0
        } else {
            transferred as f64 / total as f64
        }
    }
}

/// Shared flag for cancelling a running batch from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Every file arrived; the session is closed and scratch is gone.
    Completed,
    /// Some files still failed after all retries; scratch is retained.
    PartialFailure { failed: Vec<String> },
    /// Stopped by the user; scratch is kept, the session is back in review.
    Cancelled {
        uploaded: Vec<String>,
        not_uploaded: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub folder: String,
    pub date: String,
    pub tasks: Vec<UploadTask>,
    pub outcome: UploadOutcome,
}

impl UploadReport {
    pub fn uploaded(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.remote_target_path.as_str())
            .collect()
    }

    /// Final aggregate progress of the batch.
    pub fn progress(&self) -> f64 {
        let total: u64 = self.tasks.iter().map(UploadTask::weight).sum();
        let done: u64 = self.tasks.iter().map(|t| t.bytes_transferred.min(t.weight())).sum();
        ProgressEvent::fraction(done, total)
    }

    /// Turn a partial failure into the session-level error.
    pub fn into_result(self) -> Result<UploadReport> {
        match &self.outcome {
            UploadOutcome::PartialFailure { failed } => Err(Error::PartialFailure {
                folder: self.folder.clone(),
                failed: failed.clone(),
            }),
            _ => Ok(self),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        UploadPolicy::from(&UploadSettings::default())
    }
}

impl From<&UploadSettings> for UploadPolicy {
    fn from(s: &UploadSettings) -> Self {
        UploadPolicy {
            concurrency: s.concurrency.max(1),
            max_attempts: s.max_attempts.max(1),
            backoff: Duration::from_millis(s.backoff_ms),
        }
    }
}

impl UploadPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << (attempt - 1).min(16))
    }
}

pub struct UploadOrchestrator<'a> {
    storage: &'a dyn RemoteStorage,
    policy: UploadPolicy,
    date_format: String,
}

impl<'a> UploadOrchestrator<'a> {
    pub fn new(storage: &'a dyn RemoteStorage, policy: UploadPolicy, date_format: impl Into<String>) -> Self {
        UploadOrchestrator {
            storage,
            policy,
            date_format: date_format.into(),
        }
    }

    /// The date folder name for a batch started on `day`.
    pub fn batch_date(&self, day: NaiveDate) -> String {
        day.format(&self.date_format).to_string()
    }

    pub fn plan(&self, session: &WorkspaceSession, selected: &[CandidateFile], date: &str) -> Vec<UploadTask> {
        let folder = &session.remote_folder().display_name;
        selected
            .iter()
            .map(|c| UploadTask {
                remote_target_path: format!("{folder}/{date}/{}", c.relative_path),
                candidate: c.clone(),
                status: TaskStatus::Pending,
                bytes_transferred: 0,
                attempts: 0,
                last_error: None,
            })
            .collect()
    }

    /// Targets of a batch started on `day` that already exist remotely and
    /// would be overwritten.
    pub fn conflicts(
        &self,
        session: &WorkspaceSession,
        selected: &[CandidateFile],
        day: NaiveDate,
    ) -> Result<Vec<String>> {
        let date = self.batch_date(day);
        let mut existing = Vec::new();
        for task in self.plan(session, selected, &date) {
            if self.storage.exists(session.remote_folder(), &task.backend_path(&date))? {
                existing.push(task.remote_target_path);
            }
        }
        Ok(existing)
    }

    /// Upload `selected` under today's local date.
    pub fn upload(
        &self,
        session: &mut WorkspaceSession,
        selected: &[CandidateFile],
        events: Option<Sender<ProgressEvent>>,
        cancel: &CancelToken,
    ) -> Result<UploadReport> {
        self.upload_on(session, selected, Local::now().date_naive(), events, cancel)
    }

    /// Upload `selected` with the date folder fixed to `day` for the whole
    /// batch, then close or retain the session depending on the outcome.
    pub fn upload_on(
        &self,
        session: &mut WorkspaceSession,
        selected: &[CandidateFile],
        day: NaiveDate,
        events: Option<Sender<ProgressEvent>>,
        cancel: &CancelToken,
    ) -> Result<UploadReport> {
        let folder = session.remote_folder().display_name.clone();
        if selected.is_empty() {
            return Err(Error::NothingSelected { folder });
        }
        if matches!(session.state(), SessionState::Retained { .. }) {
            session.transition(SessionState::Collecting)?;
        }
        session.transition(SessionState::Uploading)?;

        let date = self.batch_date(day);
        let tasks = self.plan(session, selected, &date);
        info!(folder = %folder, date = %date, files = tasks.len(), "starting upload");

        let batch = Batch {
            storage: self.storage,
            policy: &self.policy,
            session: &*session,
            date: &date,
            tasks: tasks.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            progress: Arc::new(Mutex::new(Progress {
                transferred: 0,
                total: 0,
                events,
            })),
            cancel,
        };
        let tasks = batch.run();

        let failed: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.remote_target_path.clone())
            .collect();
        // A cancel that lands after the last file finished changes nothing.
        let outcome = if tasks.iter().all(|t| t.status == TaskStatus::Done) {
            session.transition(SessionState::Closed)?;
            UploadOutcome::Completed
        } else if cancel.is_cancelled() {
            let (done, rest): (Vec<&UploadTask>, Vec<&UploadTask>) =
                tasks.iter().partition(|t| t.status == TaskStatus::Done);
            let paths = |ts: Vec<&UploadTask>| -> Vec<String> {
                ts.into_iter().map(|t| t.remote_target_path.clone()).collect()
            };
            session.transition(SessionState::Collecting)?;
            UploadOutcome::Cancelled {
                uploaded: paths(done),
                not_uploaded: paths(rest),
            }
        } else {
            for t in tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
                warn!(
                    file = %t.remote_target_path,
                    attempts = t.attempts,
                    error = t.last_error.as_deref().unwrap_or("unknown"),
                    "upload failed"
                );
            }
            session.transition(SessionState::Retained {
                failed: failed.clone(),
            })?;
            UploadOutcome::PartialFailure { failed }
        };
        info!(folder = %folder, date = %date, outcome = ?outcome, "upload finished");

        Ok(UploadReport {
            folder,
            date,
            tasks,
            outcome,
        })
    }
}

struct Progress {
    transferred: u64,
    total: u64,
    events: Option<Sender<ProgressEvent>>,
}

impl Progress {
    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.events {
            // The receiver going away only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    // Counter update and event go out under one lock so observers never see
    // the aggregate go backwards.
    fn credit(&mut self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.transferred += bytes;
        self.send(ProgressEvent::Progress {
            transferred: self.transferred,
            total: self.total,
        });
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// One running upload batch, shared by the worker threads.
struct Batch<'b> {
    storage: &'b dyn RemoteStorage,
    policy: &'b UploadPolicy,
    session: &'b WorkspaceSession,
    date: &'b str,
    tasks: Vec<Mutex<UploadTask>>,
    next: AtomicUsize,
    progress: Arc<Mutex<Progress>>,
    cancel: &'b CancelToken,
}

impl Batch<'_> {
    fn run(self) -> Vec<UploadTask> {
        {
            let mut p = lock(&self.progress);
            p.total = self.tasks.iter().map(|t| lock(t).weight()).sum();
            p.send(ProgressEvent::Progress { transferred: 0, total: p.total });
        }
        let workers = self.policy.concurrency.min(self.tasks.len()).max(1);
        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| self.worker());
            }
        });
        self.tasks
            .into_iter()
            .map(|m| m.into_inner().unwrap_or_else(|p| p.into_inner()))
            .collect()
    }

    fn worker(&self) {
        while !self.cancel.is_cancelled() {
            let index = self.next.fetch_add(1, Ordering::SeqCst);
            let Some(task) = self.tasks.get(index) else {
                break;
            };
            self.run_task(task);
        }
    }

    fn run_task(&self, task: &Mutex<UploadTask>) {
        let (relative, target, backend_path, weight) = {
            let t = lock(task);
            (
                t.candidate.relative_path.clone(),
                t.remote_target_path.clone(),
                t.backend_path(self.date),
                t.weight(),
            )
        };
        let source = match join_relative(self.session.scratch_path(), &relative) {
            Ok(p) => p,
            Err(e) => {
                let mut t = lock(task);
                t.status = TaskStatus::Failed;
                t.last_error = Some(e.to_string());
                return;
            }
        };
        // Bytes credited to the aggregate for this file, across attempts.
        // Held one short of the full weight until the file is confirmed, so
        // the total only reaches 100% when every file is done.
        let credited = Arc::new(Mutex::new(0u64));

        for attempt in 1..=self.policy.max_attempts {
            if self.cancel.is_cancelled() {
                lock(task).status = TaskStatus::Pending;
                return;
            }
            {
                let mut t = lock(task);
                t.status = TaskStatus::InProgress;
                t.attempts = attempt;
            }
            lock(&self.progress).send(ProgressEvent::FileStarted {
                path: target.clone(),
                attempt,
            });

            let sink = self.byte_sink(weight, credited.clone());
            let result = self
                .storage
                .upload(self.session.remote_folder(), &backend_path, &source, sink);

            match result {
                Ok(Transfer::Completed) => {
                    let mut credited = lock(&credited);
                    let mut p = lock(&self.progress);
                    p.credit(weight - *credited);
                    *credited = weight;
                    p.send(ProgressEvent::FileDone { path: target.clone() });
                    drop(p);
                    let mut t = lock(task);
                    t.status = TaskStatus::Done;
                    t.bytes_transferred = weight;
                    t.last_error = None;
                    return;
                }
                Ok(Transfer::Aborted) => {
                    let mut t = lock(task);
                    t.status = TaskStatus::Pending;
                    t.bytes_transferred = *lock(&credited);
                    return;
                }
                Err(e) => {
                    let will_retry = attempt < self.policy.max_attempts;
                    let error = e.to_string();
                    lock(&self.progress).send(ProgressEvent::FileFailed {
                        path: target.clone(),
                        attempt,
                        error: error.clone(),
                        will_retry,
                    });
                    {
                        let mut t = lock(task);
                        t.status = TaskStatus::Failed;
                        t.bytes_transferred = *lock(&credited);
                        t.last_error = Some(error);
                    }
                    if will_retry {
                        warn!(file = %target, attempt, error = %e, "upload attempt failed, retrying");
                        self.sleep_backoff(attempt);
                    }
                }
            }
        }
        // Stay failed after the last attempt; wrap the message with context.
        let mut t = lock(task);
        let reason = t.last_error.clone().unwrap_or_default();
        t.last_error = Some(
            Error::UploadError {
                folder: self.session.remote_folder().display_name.clone(),
                file: target,
                attempts: t.attempts,
                reason,
            }
            .to_string(),
        );
    }

    fn byte_sink(&self, weight: u64, credited: Arc<Mutex<u64>>) -> ByteSink {
        let progress = self.progress.clone();
        let cancel = self.cancel.clone();
        let cap = weight.saturating_sub(1);
        let seen = Arc::new(Mutex::new(0u64));
        Arc::new(move |n| {
            let mut seen = lock(&seen);
            *seen += n;
            let mut credited = lock(&credited);
            let high_water = (*seen).min(cap);
            if high_water > *credited {
                lock(&progress).credit(high_water - *credited);
                *credited = high_water;
            }
            !cancel.is_cancelled()
        })
    }

    // Sleeps in short slices so a cancel does not wait out the backoff.
    fn sleep_backoff(&self, attempt: u32) {
        let deadline = Instant::now() + self.policy.backoff_for(attempt);
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}
