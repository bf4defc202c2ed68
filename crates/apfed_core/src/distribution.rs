/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Fan-out: one rendered payload, one `deliver` job per inbox.
//!
//! The first run of a distribution stores its resolved inbox list as the
//! plan. Jobs are inserted in fixed-size batches of that plan, and a batch
//! commits together with its progress marker, so running the same
//! distribution again after a crash only inserts the batches that are
//! missing, even if the audience changed in between.

use crate::audience::{strategy_for, Audience, AudienceContext, AudienceStrategy, ForwardAudience};
use crate::job_queue::{job_args, JobQueue};
use crate::store::FederationStore;
use anyhow::{Context, Result};
use apfed_protocol::{DeliverArgs, DeliveryOptions, DistributeArgs, JobKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct DistributionSettings {
    pub batch_size: usize,
    pub sync_followers_threshold: u64,
    pub synchronization_disabled: bool,
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            sync_followers_threshold: 25_000,
            synchronization_disabled: false,
        }
    }
}

/// Identity of one distribution: the payload, its sender, the event scope
/// and the exclusions. Exclusion order does not matter.
pub fn distribution_id(payload: &str, source_actor_id: i64, scope: &str, excluded_inboxes: &[String]) -> String {
    let mut excluded: Vec<&str> = excluded_inboxes.iter().map(|s| s.trim()).collect();
    excluded.sort_unstable();
    excluded.dedup();

    let mut h = Sha256::new();
    h.update(payload.as_bytes());
    h.update([0u8]);
    h.update(source_actor_id.to_be_bytes());
    h.update(scope.as_bytes());
    for e in excluded {
        h.update([0u8]);
        h.update(e.as_bytes());
    }
    hex::encode(h.finalize())
}

/// One entry of a stored fan-out plan.
#[derive(Debug, Serialize, Deserialize)]
struct PlannedTarget {
    inbox_url: String,
    #[serde(default)]
    options: DeliveryOptions,
}

pub struct Distributor {
    store: Arc<dyn FederationStore>,
    queue: Arc<dyn JobQueue>,
    settings: DistributionSettings,
}

impl Distributor {
    pub fn new(store: Arc<dyn FederationStore>, queue: Arc<dyn JobQueue>, settings: DistributionSettings) -> Self {
        Self { store, queue, settings }
    }

    fn context(&self) -> AudienceContext<'_> {
        AudienceContext {
            store: self.store.as_ref(),
            sync_followers_threshold: self.settings.sync_followers_threshold,
            synchronization_disabled: self.settings.synchronization_disabled,
        }
    }

    /// Runs a `distribute` job. Returns how many deliveries were enqueued.
    pub async fn run(&self, args: &DistributeArgs) -> Result<usize> {
        let strategy = strategy_for(&args.event);
        self.distribute(&args.body, args.source_actor_id, strategy.as_ref(), &args.excluded_inboxes)
            .await
    }

    pub async fn distribute(
        &self,
        payload: &str,
        source_actor_id: i64,
        strategy: &dyn AudienceStrategy,
        excluded_inboxes: &[String],
    ) -> Result<usize> {
        if self.store.actor(source_actor_id)?.is_none() {
            debug!("distribute: source actor {source_actor_id} vanished");
            return Ok(0);
        }
        let dist_id = distribution_id(payload, source_actor_id, &strategy.scope(), excluded_inboxes);
        let mut audience = strategy.resolve_audience(&self.context())?;
        audience.exclude(excluded_inboxes);
        self.enqueue_audience(&dist_id, payload, source_actor_id, audience).await
    }

    /// Re-delivers an already rendered payload to an explicit inbox set.
    pub async fn forward(
        &self,
        payload: &str,
        source_actor_id: i64,
        inboxes: Vec<String>,
        excluded_inboxes: &[String],
    ) -> Result<usize> {
        self.distribute(payload, source_actor_id, &ForwardAudience::explicit(inboxes), excluded_inboxes)
            .await
    }

    async fn enqueue_audience(
        &self,
        dist_id: &str,
        payload: &str,
        source_actor_id: i64,
        audience: Audience,
    ) -> Result<usize> {
        let mut planned = Vec::with_capacity(audience.len());
        for t in audience.into_targets() {
            planned.push(job_args(&PlannedTarget {
                inbox_url: t.inbox_url,
                options: t.options,
            })?);
        }
        // An interrupted run keeps its original plan.
        let plan = self.queue.plan_distribution(dist_id, planned).await?;
        if plan.is_empty() {
            return Ok(0);
        }
        let total = plan.len();
        let mut enqueued = 0usize;

        for (index, chunk) in plan.chunks(self.settings.batch_size.max(1)).enumerate() {
            let mut batch = Vec::with_capacity(chunk.len());
            for entry in chunk {
                let t: PlannedTarget = serde_json::from_str(entry).context("decode fan-out plan")?;
                batch.push(job_args(&DeliverArgs {
                    body: payload.to_string(),
                    source_actor_id,
                    inbox_url: t.inbox_url,
                    options: t.options,
                })?);
            }
            let n = batch.len();
            if self
                .queue
                .enqueue_batch(dist_id, index as u32, JobKind::Deliver, batch)
                .await?
            {
                enqueued += n;
            } else {
                debug!("distribution {dist_id}: batch {index} already committed");
            }
        }

        info!("distribution {}: {enqueued}/{total} deliveries enqueued", &dist_id[..12]);
        Ok(enqueued)
    }
}

/// Queues a whole distribution so the queue can retry it.
pub async fn enqueue_distribution(queue: &dyn JobQueue, args: &DistributeArgs) -> Result<()> {
    queue.enqueue(JobKind::Distribute, job_args(args)?).await
}
