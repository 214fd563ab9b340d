//! Background turn jobs.
//!
//! Every turn runs on its own detached task, so a client that disconnects
//! does not cancel it and the committed result stays retrievable. At most one
//! job per session is in flight; a second submission is refused with the
//! running job's id.
//!
//! Outcomes that finished with nobody listening are queued per session and
//! handed back on the caller's next visit.

use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use turnkeep_core::event::{EventBus, ProgressEvent};
use turnkeep_core::session::SessionKey;
use turnkeep_engine::{EngineError, TurnEngine, TurnRequest, TurnResult};

/// Job records kept before the oldest finished ones are evicted.
const MAX_JOBS: usize = 1_000;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub session_id: String,
    #[serde(skip)]
    pub user_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TurnResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    fn key(&self) -> SessionKey {
        SessionKey::new(&self.user_id, &self.session_id)
    }

    /// The event that ended the job, once it has ended.
    pub fn terminal_event(&self) -> Option<ProgressEvent> {
        match (self.status, &self.result) {
            (JobStatus::Completed, Some(result)) => Some(ProgressEvent::Done {
                turn_number: result.turn_number,
                reply: result.reply.clone(),
            }),
            (JobStatus::Failed, _) => Some(ProgressEvent::Error {
                message: self.error.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// A finished job whose outcome no client has received.
#[derive(Debug, Clone, Serialize)]
pub struct Undelivered {
    pub job_id: String,
    pub event: ProgressEvent,
    pub completed_at: DateTime<Utc>,
}

struct Job {
    record: JobRecord,
    bus: EventBus,
    finished: watch::Receiver<Option<ProgressEvent>>,
}

/// Live progress of one job.
pub struct JobFeed {
    job_id: String,
    events: broadcast::Receiver<Arc<ProgressEvent>>,
    finished: watch::Receiver<Option<ProgressEvent>>,
}

impl JobFeed {
    /// Forward progress into `tx` until the job ends or the receiver goes
    /// away. Always opens with `job_accepted` and closes with `done` or
    /// `error`, even when the job finished before the feed was opened.
    pub async fn pump(mut self, tx: mpsc::Sender<ProgressEvent>) {
        let accepted = ProgressEvent::JobAccepted {
            job_id: self.job_id.clone(),
        };
        if tx.send(accepted).await.is_err() {
            return;
        }
        loop {
            let finished = self.finished.borrow_and_update().clone();
            if let Some(event) = finished {
                // Progress published before the job ended may still be buffered
                loop {
                    match self.events.try_recv() {
                        Ok(buffered) => {
                            let terminal = buffered.is_terminal();
                            if tx.send(buffered.as_ref().clone()).await.is_err() || terminal {
                                return;
                            }
                        }
                        Err(TryRecvError::Lagged(skipped)) => {
                            warn!(job_id = %self.job_id, skipped, "Event feed lagged, dropping old events");
                        }
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }
                let _ = tx.send(event).await;
                return;
            }
            tokio::select! {
                biased;
                received = self.events.recv() => match received {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        if tx.send(event.as_ref().clone()).await.is_err() || terminal {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(job_id = %self.job_id, skipped, "Event feed lagged, dropping old events");
                    }
                    Err(RecvError::Closed) => {
                        if self.finished.changed().await.is_err() && self.finished.borrow().is_none() {
                            return;
                        }
                    }
                },
                changed = self.finished.changed() => {
                    if changed.is_err() && self.finished.borrow().is_none() {
                        return;
                    }
                }
            }
        }
    }
}

pub struct JobManager {
    engine: Arc<TurnEngine>,
    jobs: RwLock<HashMap<String, Job>>,
    in_flight: Mutex<HashMap<SessionKey, String>>,
    undelivered: Mutex<HashMap<SessionKey, Vec<Undelivered>>>,
    queue_undelivered: bool,
    capacity: usize,
}

/// Held briefly and never across an await.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl JobManager {
    pub fn new(engine: Arc<TurnEngine>) -> Self {
        let queue_undelivered = engine.config().gateway.queue_undelivered;
        Self {
            engine,
            jobs: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            undelivered: Mutex::new(HashMap::new()),
            queue_undelivered,
            capacity: MAX_JOBS,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn engine(&self) -> &Arc<TurnEngine> {
        &self.engine
    }

    /// Start a turn in the background. Returns the job id.
    pub async fn submit(
        self: &Arc<Self>,
        key: SessionKey,
        request: TurnRequest,
    ) -> Result<String, GatewayError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        {
            let mut in_flight = lock(&self.in_flight);
            if let Some(running) = in_flight.get(&key) {
                warn!(session = %key, job_id = %running, "Turn rejected, session busy");
                return Err(GatewayError::SessionBusy {
                    job_id: running.clone(),
                });
            }
            in_flight.insert(key.clone(), job_id.clone());
        }

        let bus = EventBus::default();
        let (done_tx, done_rx) = watch::channel(None);
        {
            let mut jobs = self.jobs.write().await;
            self.evict(&mut jobs);
            jobs.insert(
                job_id.clone(),
                Job {
                    record: JobRecord {
                        id: job_id.clone(),
                        session_id: key.session_id.clone(),
                        user_id: key.user_id.clone(),
                        status: JobStatus::Running,
                        started_at: Utc::now(),
                        completed_at: None,
                        result: None,
                        error: None,
                    },
                    bus: bus.clone(),
                    finished: done_rx,
                },
            );
        }
        info!(session = %key, job_id = %job_id, "Turn job accepted");

        let manager = Arc::clone(self);
        let id = job_id.clone();
        tokio::spawn(async move {
            let outcome = manager.engine.run_turn(&key, request, &bus).await;
            manager.finish(&key, &id, outcome, &bus, done_tx).await;
        });
        Ok(job_id)
    }

    async fn finish(
        &self,
        key: &SessionKey,
        job_id: &str,
        outcome: Result<TurnResult, EngineError>,
        bus: &EventBus,
        done: watch::Sender<Option<ProgressEvent>>,
    ) {
        let terminal = {
            let mut jobs = self.jobs.write().await;
            jobs.get_mut(job_id).and_then(|job| {
                let record = &mut job.record;
                record.completed_at = Some(Utc::now());
                match outcome {
                    Ok(result) => {
                        record.status = JobStatus::Completed;
                        record.result = Some(result);
                    }
                    Err(e) => {
                        record.status = JobStatus::Failed;
                        record.error = Some(e.user_message());
                    }
                }
                record.terminal_event()
            })
        };

        if let Some(event) = terminal {
            let unheard = bus.subscriber_count() == 0;
            done.send_replace(Some(event.clone()));
            debug!(session = %key, job_id, unheard, "Turn job finished");

            if unheard && self.queue_undelivered {
                info!(session = %key, job_id, "No listener, queueing turn outcome");
                lock(&self.undelivered)
                    .entry(key.clone())
                    .or_default()
                    .push(Undelivered {
                        job_id: job_id.to_string(),
                        event,
                        completed_at: Utc::now(),
                    });
            }
        }
        // Last, so the next submit for this session already sees the outcome
        lock(&self.in_flight).remove(key);
    }

    fn evict(&self, jobs: &mut HashMap<String, Job>) {
        while jobs.len() >= self.capacity {
            let oldest = jobs
                .values()
                .filter(|j| j.record.status != JobStatus::Running)
                .min_by_key(|j| j.record.started_at)
                .map(|j| j.record.id.clone());
            match oldest {
                Some(id) => {
                    jobs.remove(&id);
                }
                None => break,
            }
        }
    }

    /// A job record, visible only to the user that started it.
    pub async fn get(&self, job_id: &str, user_id: &str) -> Result<JobRecord, GatewayError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .filter(|j| j.record.user_id == user_id)
            .map(|j| j.record.clone())
            .ok_or_else(|| GatewayError::JobNotFound(job_id.to_string()))
    }

    /// Open a progress feed. Opening the feed of a finished job counts as
    /// delivering its outcome.
    pub async fn feed(&self, job_id: &str, user_id: &str) -> Result<JobFeed, GatewayError> {
        let (feed, finished_key) = {
            let jobs = self.jobs.read().await;
            let job = jobs
                .get(job_id)
                .filter(|j| j.record.user_id == user_id)
                .ok_or_else(|| GatewayError::JobNotFound(job_id.to_string()))?;
            let feed = JobFeed {
                job_id: job_id.to_string(),
                events: job.bus.subscribe(),
                finished: job.finished.clone(),
            };
            let finished_key = (job.record.status != JobStatus::Running).then(|| job.record.key());
            (feed, finished_key)
        };
        if let Some(key) = finished_key {
            self.acknowledge(&key, job_id);
        }
        Ok(feed)
    }

    fn acknowledge(&self, key: &SessionKey, job_id: &str) {
        if let Some(queue) = lock(&self.undelivered).get_mut(key) {
            queue.retain(|u| u.job_id != job_id);
        }
    }

    /// Take every queued outcome for a session.
    pub fn drain_undelivered(&self, key: &SessionKey) -> Vec<Undelivered> {
        lock(&self.undelivered).remove(key).unwrap_or_default()
    }

    /// The job currently running for a session, if any.
    pub fn in_flight(&self, key: &SessionKey) -> Option<String> {
        lock(&self.in_flight).get(key).cloned()
    }
}
