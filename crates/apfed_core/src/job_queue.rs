/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Durable at-least-once job queue on sqlite.
//!
//! Workers claim due jobs by pushing `next_attempt_at_ms` forward by a lease,
//! so a crashed worker's jobs come back once the lease runs out. Failed jobs
//! are rescheduled with exponential backoff until their kind's budget is spent.

use crate::metrics::FederationMetrics;
use anyhow::{Context, Result};
use apfed_protocol::JobKind;
use async_trait::async_trait;
use futures_util::StreamExt;
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

const STATUS_PENDING: i64 = 0;
const STATUS_DONE: i64 = 1;
const STATUS_DEAD: i64 = 2;
const STATUS_DISCARDED: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Transient; the queue tries again later.
    #[error("{0:#}")]
    Retry(#[from] anyhow::Error),
    /// Permanent; the job is dropped.
    #[error("discarded: {0}")]
    Discard(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done,
    Dead,
    Discarded,
}

impl JobStatus {
    fn from_db(v: i64) -> Self {
        match v {
            STATUS_DONE => JobStatus::Done,
            STATUS_DEAD => JobStatus::Dead,
            STATUS_DISCARDED => JobStatus::Discarded,
            _ => JobStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub args_json: String,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Job {
    /// Arguments that do not parse can never succeed, so they discard the job.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_str(&self.args_json)
            .map_err(|e| JobError::Discard(format!("bad {} args: {e}", self.kind)))
    }
}

pub fn job_args<T: Serialize>(args: &T) -> Result<String> {
    serde_json::to_string(args).context("serialize job args")
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job) -> Result<(), JobError>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, kind: JobKind, args_json: String) -> Result<()>;
    async fn enqueue_bulk(&self, kind: JobKind, args_json: Vec<String>) -> Result<usize>;
    /// Inserts one fan-out batch and advances the distribution's progress in
    /// the same transaction. Returns false, inserting nothing, when the batch
    /// was already committed.
    async fn enqueue_batch(
        &self,
        distribution_id: &str,
        batch_index: u32,
        kind: JobKind,
        args_json: Vec<String>,
    ) -> Result<bool>;
    async fn committed_batches(&self, distribution_id: &str) -> Result<u32>;
    /// Stores `targets` as the distribution's fan-out plan unless a plan was
    /// stored by an earlier run, and returns the stored plan in order. Batch
    /// indices always refer to this plan.
    async fn plan_distribution(&self, distribution_id: &str, targets: Vec<String>) -> Result<Vec<String>>;
}

#[derive(Clone, Copy, Debug)]
pub struct QueueSettings {
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub lease_secs: u64,
    pub tick: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            base_backoff_secs: 5,
            max_backoff_secs: 6 * 3600,
            lease_secs: 300,
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: u64,
    pub done: u64,
    pub dead: u64,
    pub discarded: u64,
}

#[derive(Clone)]
pub struct SqliteJobQueue {
    db_path: PathBuf,
    notify: Arc<Notify>,
    settings: QueueSettings,
    metrics: Arc<FederationMetrics>,
}

impl SqliteJobQueue {
    pub fn open(db_path: impl AsRef<Path>, settings: QueueSettings, metrics: Arc<FederationMetrics>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
            settings,
            metrics,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn start_worker(&self, shutdown: watch::Receiver<bool>, runner: Arc<dyn JobRunner>, concurrency: usize) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.run_loop(shutdown, runner, concurrency.max(1)).await {
                warn!("job worker stopped: {e:#}");
            }
        });
    }

    async fn run_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        runner: Arc<dyn JobRunner>,
        concurrency: usize,
    ) -> Result<()> {
        info!("job queue db: {}", self.db_path.display());
        loop {
            if *shutdown.borrow() {
                break;
            }

            let jobs = self.claim_due(concurrency as u32 * 4).await?;
            if jobs.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.settings.tick) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            futures_util::stream::iter(jobs)
                .for_each_concurrent(concurrency, |job| {
                    let runner = runner.clone();
                    async move {
                        if let Err(e) = self.run_one(runner.as_ref(), job).await {
                            warn!("job bookkeeping error: {e:#}");
                        }
                    }
                })
                .await;
        }
        Ok(())
    }

    /// Claims and runs every due job once, sequentially. Returns how many ran.
    pub async fn run_due_once(&self, runner: &dyn JobRunner) -> Result<usize> {
        let jobs = self.claim_due(10_000).await?;
        let n = jobs.len();
        for job in jobs {
            self.run_one(runner, job).await?;
        }
        Ok(n)
    }

    /// Runs due jobs until none are left (jobs enqueued by jobs included).
    pub async fn drain(&self, runner: &dyn JobRunner) -> Result<usize> {
        let mut total = 0;
        for _ in 0..64 {
            let n = self.run_due_once(runner).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    async fn run_one(&self, runner: &dyn JobRunner, job: Job) -> Result<()> {
        match runner.run(&job).await {
            Ok(()) => {
                FederationMetrics::incr(&self.metrics.jobs_done);
                self.finish(&job.id, STATUS_DONE, None).await
            }
            Err(JobError::Discard(reason)) => {
                debug!("job {} ({}) discarded: {reason}", job.id, job.kind);
                FederationMetrics::incr(&self.metrics.jobs_discarded);
                self.finish(&job.id, STATUS_DISCARDED, Some(reason)).await
            }
            Err(JobError::Retry(e)) => {
                let attempt_no = job.attempt.saturating_add(1);
                let err = format!("{e:#}");
                if attempt_no >= job.max_attempts {
                    warn!("job {} ({}) dead after {attempt_no} attempts: {err}", job.id, job.kind);
                    FederationMetrics::incr(&self.metrics.jobs_dead);
                    return self.finish(&job.id, STATUS_DEAD, Some(err)).await;
                }
                debug!("job {} ({}) attempt {attempt_no} failed: {err}", job.id, job.kind);
                FederationMetrics::incr(&self.metrics.jobs_retried);
                let next = now_ms().saturating_add(
                    next_backoff(attempt_no, self.settings.base_backoff_secs, self.settings.max_backoff_secs)
                        .as_millis() as i64,
                );
                self.reschedule(&job.id, attempt_no, next, err).await
            }
        }
    }

    async fn claim_due(&self, limit: u32) -> Result<Vec<Job>> {
        let lease_ms = (self.settings.lease_secs as i64).saturating_mul(1000);
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<Job>> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction()?;
                let now = now_ms();
                let mut out = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        r#"
                        SELECT id, kind, args_json, attempt, max_attempts
                        FROM jobs
                        WHERE status = ?1 AND next_attempt_at_ms <= ?2
                        ORDER BY next_attempt_at_ms ASC, rowid ASC
                        LIMIT ?3
                        "#,
                    )?;
                    let mut rows = stmt.query(params![STATUS_PENDING, now, limit])?;
                    while let Some(row) = rows.next()? {
                        let id: String = row.get(0)?;
                        let kind: String = row.get(1)?;
                        let Some(kind) = JobKind::from_str(&kind) else {
                            warn!("job {id} has unknown kind {kind}");
                            continue;
                        };
                        out.push(Job {
                            id,
                            kind,
                            args_json: row.get(2)?,
                            attempt: row.get::<_, i64>(3)?.max(0) as u32,
                            max_attempts: row.get::<_, i64>(4)?.max(1) as u32,
                        });
                    }
                }
                for job in &out {
                    tx.execute(
                        "UPDATE jobs SET next_attempt_at_ms=?2 WHERE id=?1",
                        params![job.id, now.saturating_add(lease_ms)],
                    )?;
                }
                tx.commit()?;
                Ok(out)
            }
        })
        .await?
    }

    async fn finish(&self, id: &str, status: i64, err: Option<String>) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "UPDATE jobs SET status=?2, last_error=?3 WHERE id=?1",
                    params![id, status, err],
                )?;
                Ok(())
            }
        })
        .await?
    }

    async fn reschedule(&self, id: &str, attempt_no: u32, next_attempt_at_ms: i64, err: String) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "UPDATE jobs SET attempt=?2, next_attempt_at_ms=?3, last_error=?4 WHERE id=?1",
                    params![id, attempt_no, next_attempt_at_ms, err],
                )?;
                Ok(())
            }
        })
        .await?
    }

    /// Pending jobs, optionally of one kind, in insertion order.
    pub async fn pending_jobs(&self, kind: Option<JobKind>) -> Result<Vec<Job>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<Job>> {
                let conn = Connection::open(db_path)?;
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, kind, args_json, attempt, max_attempts
                    FROM jobs
                    WHERE status = ?1 AND (?2 IS NULL OR kind = ?2)
                    ORDER BY rowid ASC
                    "#,
                )?;
                let kind_str = kind.map(|k| k.as_str());
                let rows = stmt.query_map(params![STATUS_PENDING, kind_str], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, kind, args_json, attempt, max_attempts) = row?;
                    if let Some(kind) = JobKind::from_str(&kind) {
                        out.push(Job {
                            id,
                            kind,
                            args_json,
                            attempt: attempt.max(0) as u32,
                            max_attempts: max_attempts.max(1) as u32,
                        });
                    }
                }
                Ok(out)
            }
        })
        .await?
    }

    pub async fn job_status(&self, id: &str) -> Result<Option<JobStatus>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            move || -> Result<Option<JobStatus>> {
                let conn = Connection::open(db_path)?;
                let st: Option<i64> = conn
                    .query_row("SELECT status FROM jobs WHERE id=?1", params![id], |r| r.get(0))
                    .optional()?;
                Ok(st.map(JobStatus::from_db))
            }
        })
        .await?
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<JobCounts> {
                let conn = Connection::open(db_path)?;
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
                let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
                let mut c = JobCounts::default();
                for row in rows {
                    let (status, n) = row?;
                    let n = n.max(0) as u64;
                    match status {
                        STATUS_PENDING => c.pending = n,
                        STATUS_DONE => c.done = n,
                        STATUS_DEAD => c.dead = n,
                        STATUS_DISCARDED => c.discarded = n,
                        _ => {}
                    }
                }
                Ok(c)
            }
        })
        .await?
    }

    /// Makes every pending job due now, skipping backoff and leases.
    pub async fn expedite_pending(&self) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "UPDATE jobs SET next_attempt_at_ms=0 WHERE status=?1",
                    params![STATUS_PENDING],
                )?;
                Ok(())
            }
        })
        .await?
    }
}

fn insert_job(tx: &rusqlite::Transaction<'_>, kind: JobKind, args_json: &str, now: i64) -> rusqlite::Result<usize> {
    tx.execute(
        r#"
        INSERT INTO jobs (id, kind, args_json, created_at_ms, next_attempt_at_ms, attempt, max_attempts, status, last_error)
        VALUES (?1, ?2, ?3, ?4, ?4, 0, ?5, ?6, NULL)
        "#,
        params![new_job_id(), kind.as_str(), args_json, now, kind.default_max_attempts(), STATUS_PENDING],
    )
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, kind: JobKind, args_json: String) -> Result<()> {
        self.enqueue_bulk(kind, vec![args_json]).await.map(|_| ())
    }

    async fn enqueue_bulk(&self, kind: JobKind, args_json: Vec<String>) -> Result<usize> {
        if args_json.is_empty() {
            return Ok(0);
        }
        let count = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<usize> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction()?;
                let now = now_ms();
                for a in &args_json {
                    insert_job(&tx, kind, a, now)?;
                }
                tx.commit()?;
                Ok(args_json.len())
            }
        })
        .await??;
        FederationMetrics::add(&self.metrics.jobs_enqueued, count as u64);
        self.notify.notify_one();
        Ok(count)
    }

    async fn enqueue_batch(
        &self,
        distribution_id: &str,
        batch_index: u32,
        kind: JobKind,
        args_json: Vec<String>,
    ) -> Result<bool> {
        let inserted = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let distribution_id = distribution_id.to_string();
            let n = args_json.len();
            move || -> Result<Option<usize>> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction()?;
                let done: i64 = tx
                    .query_row(
                        "SELECT batches_enqueued FROM fanout_progress WHERE distribution_id=?1",
                        params![distribution_id],
                        |r| r.get(0),
                    )
                    .optional()?
                    .unwrap_or(0);
                if (batch_index as i64) < done {
                    return Ok(None);
                }
                let now = now_ms();
                for a in &args_json {
                    insert_job(&tx, kind, a, now)?;
                }
                tx.execute(
                    r#"
                    INSERT INTO fanout_progress (distribution_id, batches_enqueued, updated_at_ms)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(distribution_id) DO UPDATE SET
                      batches_enqueued=excluded.batches_enqueued,
                      updated_at_ms=excluded.updated_at_ms
                    "#,
                    params![distribution_id, batch_index as i64 + 1, now],
                )?;
                tx.commit()?;
                Ok(Some(n))
            }
        })
        .await??;
        match inserted {
            Some(n) => {
                FederationMetrics::add(&self.metrics.jobs_enqueued, n as u64);
                self.notify.notify_one();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn committed_batches(&self, distribution_id: &str) -> Result<u32> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let distribution_id = distribution_id.to_string();
            move || -> Result<u32> {
                let conn = Connection::open(db_path)?;
                let done: Option<i64> = conn
                    .query_row(
                        "SELECT batches_enqueued FROM fanout_progress WHERE distribution_id=?1",
                        params![distribution_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(done.unwrap_or(0).max(0) as u32)
            }
        })
        .await?
    }

    async fn plan_distribution(&self, distribution_id: &str, targets: Vec<String>) -> Result<Vec<String>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let distribution_id = distribution_id.to_string();
            move || -> Result<Vec<String>> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction()?;
                let stored = {
                    let mut stmt = tx.prepare(
                        "SELECT target FROM fanout_targets WHERE distribution_id=?1 ORDER BY position ASC",
                    )?;
                    let rows = stmt.query_map(params![distribution_id], |r| r.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<Vec<String>>>()?
                };
                if !stored.is_empty() {
                    return Ok(stored);
                }
                for (position, t) in targets.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO fanout_targets (distribution_id, position, target) VALUES (?1, ?2, ?3)",
                        params![distribution_id, position as i64, t],
                    )?;
                }
                tx.commit()?;
                Ok(targets)
            }
        })
        .await?
    }
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          kind TEXT NOT NULL,
          args_json TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          max_attempts INTEGER NOT NULL,
          status INTEGER NOT NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, next_attempt_at_ms);

        CREATE TABLE IF NOT EXISTS fanout_progress (
          distribution_id TEXT PRIMARY KEY,
          batches_enqueued INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fanout_targets (
          distribution_id TEXT NOT NULL,
          position INTEGER NOT NULL,
          target TEXT NOT NULL,
          PRIMARY KEY (distribution_id, position)
        );
        "#,
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn new_job_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

pub fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << pow).min(max_secs);
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}
