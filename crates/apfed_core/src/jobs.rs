/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Maps queued job kinds onto the components that do the work.

use crate::delivery::{Delivery, DeliveryError, DeliveryOutcome};
use crate::distribution::Distributor;
use crate::followers_sync::FollowersSynchronizer;
use crate::ingest::{resolve_remote_actor, IngestOutcome, Ingestor};
use crate::job_queue::{Job, JobError, JobRunner};
use crate::object_fetch::ObjectFetcher;
use crate::replies::ReplyCrawler;
use crate::store::FederationStore;
use apfed_protocol::{
    CrawlRepliesArgs, DeliverArgs, DistributeArgs, FetchReplyArgs, JobKind, ProcessInboundArgs, ResolveActorArgs,
    ResolveThreadArgs, SynchronizeFollowersArgs,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct FederationJobs {
    pub store: Arc<dyn FederationStore>,
    pub fetcher: Arc<dyn ObjectFetcher>,
    pub delivery: Delivery,
    pub ingestor: Ingestor,
    pub distributor: Distributor,
    pub crawler: ReplyCrawler,
    pub synchronizer: FollowersSynchronizer,
}

impl FederationJobs {
    async fn deliver(&self, args: &DeliverArgs) -> Result<(), JobError> {
        match self.delivery.deliver(args).await {
            Ok(DeliveryOutcome::Delivered) | Ok(DeliveryOutcome::Skipped) => Ok(()),
            Ok(DeliveryOutcome::Unsalvageable(code)) => {
                debug!("deliver {}: giving up on http {code}", args.inbox_url);
                Ok(())
            }
            // Unavailable hosts are not retried until they contact us again.
            Err(DeliveryError::Unavailable(inbox)) => {
                debug!("deliver: {inbox} unavailable, dropping");
                Ok(())
            }
            Err(e @ DeliveryError::CircuitOpen(_)) => Err(JobError::Retry(anyhow::Error::new(e))),
            Err(DeliveryError::Retryable(e)) => Err(JobError::Retry(e)),
        }
    }
}

#[async_trait]
impl JobRunner for FederationJobs {
    async fn run(&self, job: &Job) -> Result<(), JobError> {
        match job.kind {
            JobKind::Deliver => self.deliver(&job.args::<DeliverArgs>()?).await,
            JobKind::ProcessInbound => {
                match self.ingestor.process(&job.args::<ProcessInboundArgs>()?).await? {
                    IngestOutcome::Processed(_) | IngestOutcome::Duplicate => Ok(()),
                }
            }
            JobKind::Distribute => {
                self.distributor.run(&job.args::<DistributeArgs>()?).await?;
                Ok(())
            }
            JobKind::FetchReply => {
                let args = job.args::<FetchReplyArgs>()?;
                if self.crawler.fetch_reply(&args.uri).await?.is_none() {
                    debug!("fetch_reply: nothing recorded for {}", args.uri);
                }
                Ok(())
            }
            JobKind::CrawlReplies => {
                self.crawler.crawl(&job.args::<CrawlRepliesArgs>()?.uri).await?;
                Ok(())
            }
            JobKind::ResolveThread => {
                let args = job.args::<ResolveThreadArgs>()?;
                self.crawler.resolve_thread(&args.uri, args.depth).await?;
                Ok(())
            }
            JobKind::ResolveActor => {
                let args = job.args::<ResolveActorArgs>()?;
                if resolve_remote_actor(self.store.as_ref(), self.fetcher.as_ref(), &args.uri)
                    .await?
                    .is_none()
                {
                    debug!("resolve_actor: {} is gone", args.uri);
                }
                Ok(())
            }
            JobKind::SynchronizeFollowers => {
                self.synchronizer
                    .synchronize(&job.args::<SynchronizeFollowersArgs>()?)
                    .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakers;
    use crate::collection::tests::StaticFetcher;
    use crate::distribution::DistributionSettings;
    use crate::failure_tracker::{DeliveryHealth, FailureTracker};
    use crate::ingest::StoreActivityHandler;
    use crate::job_queue::tests::temp_queue;
    use crate::job_queue::{job_args, JobQueue, JobStatus, SqliteJobQueue};
    use crate::keys::tests::test_identity;
    use crate::metrics::FederationMetrics;
    use crate::replies::CrawlLimits;
    use crate::signed_request::{RsaSha256Signer, SignedRequestBuilder};
    use crate::store::tests::temp_store;
    use crate::store::{Actor, NewActor, SqliteStore};
    use apfed_protocol::DeliveryOptions;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _sdir: tempfile::TempDir,
        _qdir: tempfile::TempDir,
        queue: Arc<SqliteJobQueue>,
        tracker: Arc<FailureTracker>,
        jobs: FederationJobs,
        sender: Actor,
    }

    fn fixture(fetcher: StaticFetcher) -> Fixture {
        let (sdir, store) = temp_store();
        let (qdir, queue) = temp_queue();
        let id = test_identity();
        let sender = store
            .upsert_actor(&NewActor {
                uri: "https://local.example/users/me".into(),
                username: "me".into(),
                local: true,
                inbox_url: "https://local.example/users/me/inbox".into(),
                public_key_pem: Some(id.public_key_pem),
                private_key_pem: Some(id.private_key_pem),
                ..Default::default()
            })
            .unwrap();
        let store: Arc<SqliteStore> = Arc::new(store);
        let queue = Arc::new(queue);
        let tracker = Arc::new(FailureTracker::new(7));
        let metrics = Arc::new(FederationMetrics::new());
        let fetcher: Arc<dyn ObjectFetcher> = Arc::new(fetcher);
        let base = "https://local.example";

        let jobs = FederationJobs {
            store: store.clone(),
            fetcher: fetcher.clone(),
            delivery: Delivery::new(
                reqwest::Client::new(),
                store.clone(),
                tracker.clone(),
                Arc::new(CircuitBreakers::new(10, Duration::from_secs(60))),
                SignedRequestBuilder::new(Arc::new(RsaSha256Signer)),
                metrics.clone(),
            ),
            ingestor: Ingestor::new(
                store.clone(),
                Arc::new(StoreActivityHandler::new(store.clone(), base)),
                queue.clone(),
                metrics.clone(),
            ),
            distributor: Distributor::new(store.clone(), queue.clone(), DistributionSettings::default()),
            crawler: ReplyCrawler::new(
                store.clone(),
                fetcher.clone(),
                queue.clone(),
                metrics.clone(),
                base,
                CrawlLimits::default(),
            ),
            synchronizer: FollowersSynchronizer::new(store.clone(), fetcher, queue.clone(), base, 1000, 50),
        };
        Fixture {
            _sdir: sdir,
            _qdir: qdir,
            queue,
            tracker,
            jobs,
            sender,
        }
    }

    async fn enqueue_delivery(f: &Fixture, inbox: String) {
        let args = DeliverArgs {
            body: r#"{"type":"Create"}"#.into(),
            source_actor_id: f.sender.id,
            inbox_url: inbox,
            options: DeliveryOptions::default(),
        };
        f.queue.enqueue(JobKind::Deliver, job_args(&args).unwrap()).await.unwrap();
    }

    async fn only_job_status(f: &Fixture) -> JobStatus {
        let c = f.queue.counts().await.unwrap();
        if c.done == 1 {
            JobStatus::Done
        } else if c.pending == 1 {
            JobStatus::Pending
        } else {
            panic!("unexpected counts {c:?}")
        }
    }

    #[tokio::test]
    async fn gone_inbox_completes_the_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inbox"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        let f = fixture(StaticFetcher::default());
        enqueue_delivery(&f, format!("{}/inbox", server.uri())).await;
        f.queue.run_due_once(&f.jobs).await.unwrap();
        assert_eq!(only_job_status(&f).await, JobStatus::Done);
    }

    #[tokio::test]
    async fn unavailable_upstream_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inbox"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let f = fixture(StaticFetcher::default());
        enqueue_delivery(&f, format!("{}/inbox", server.uri())).await;
        f.queue.run_due_once(&f.jobs).await.unwrap();
        assert_eq!(only_job_status(&f).await, JobStatus::Pending);
        let pending = f.queue.pending_jobs(Some(JobKind::Deliver)).await.unwrap();
        assert_eq!(pending[0].attempt, 1);
    }

    #[tokio::test]
    async fn unavailable_host_is_dropped_without_a_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&server)
            .await;
        let f = fixture(StaticFetcher::default());
        let inbox = format!("{}/inbox", server.uri());
        let day = 86_400_000i64;
        for d in 0..7 {
            f.tracker.track_failure_at(&inbox, 1_700_000_000_000 + d * day);
        }
        assert!(!f.tracker.available(&inbox));
        enqueue_delivery(&f, inbox).await;
        f.queue.run_due_once(&f.jobs).await.unwrap();
        assert_eq!(only_job_status(&f).await, JobStatus::Done);
    }

    #[tokio::test]
    async fn malformed_args_are_discarded() {
        let f = fixture(StaticFetcher::default());
        f.queue.enqueue(JobKind::ResolveThread, "not json".into()).await.unwrap();
        f.queue.run_due_once(&f.jobs).await.unwrap();
        assert_eq!(f.queue.counts().await.unwrap().discarded, 1);
    }

    #[tokio::test]
    async fn resolve_actor_records_the_document() {
        let mut fetcher = StaticFetcher::default();
        fetcher.docs.insert(
            "https://r.example/users/bob".into(),
            serde_json::json!({
                "id": "https://r.example/users/bob",
                "type": "Person",
                "preferredUsername": "bob",
                "inbox": "https://r.example/users/bob/inbox",
                "endpoints": {"sharedInbox": "https://r.example/inbox"},
            }),
        );
        let f = fixture(fetcher);
        f.queue
            .enqueue(
                JobKind::ResolveActor,
                job_args(&ResolveActorArgs {
                    uri: "https://r.example/users/bob".into(),
                })
                .unwrap(),
            )
            .await
            .unwrap();
        f.queue.drain(&f.jobs).await.unwrap();
        let bob = f.jobs.store.actor_by_uri("https://r.example/users/bob").unwrap().unwrap();
        assert_eq!(bob.preferred_inbox_url(), "https://r.example/inbox");
    }
}
