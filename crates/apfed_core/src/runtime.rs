/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::circuit_breaker::CircuitBreakers;
use crate::config::FederationConfig;
use crate::delivery::{http_client, Delivery};
use crate::distribution::{enqueue_distribution, DistributionSettings, Distributor};
use crate::failure_tracker::FailureTracker;
use crate::followers_sync::FollowersSynchronizer;
use crate::http_sig::{HttpSignatureVerifier, KeyResolver, RequestVerifier};
use crate::inbox::InboxGate;
use crate::ingest::{Ingestor, StoreActivityHandler};
use crate::job_queue::{QueueSettings, SqliteJobQueue};
use crate::jobs::FederationJobs;
use crate::keys::{default_data_dir, instance_actor, load_or_generate_identity};
use crate::metrics::FederationMetrics;
use crate::object_fetch::{HttpObjectFetcher, ObjectFetcher};
use crate::replies::{CrawlLimits, ReplyCrawler};
use crate::server::{router, AppState};
use crate::signed_request::{RsaSha256Signer, SignedRequestBuilder, SigningActor};
use crate::store::{Actor, FederationStore, SqliteStore};
use anyhow::{Context, Result};
use apfed_protocol::DistributeArgs;
use axum::Router;
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};
use tokio::sync::watch;
use tracing::{error, info};

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);

struct RunningFederation {
    shutdown_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
}

static REGISTRY: Mutex<Vec<(u64, RunningFederation)>> = Mutex::new(Vec::new());

/// Every component of a running federation engine, wired from one config.
pub struct Federation {
    pub config: FederationConfig,
    pub store: Arc<SqliteStore>,
    pub queue: Arc<SqliteJobQueue>,
    pub metrics: Arc<FederationMetrics>,
    pub tracker: Arc<FailureTracker>,
    pub breakers: Arc<CircuitBreakers>,
    pub instance_actor: Actor,
    pub jobs: Arc<FederationJobs>,
    state: AppState,
}

impl Federation {
    pub fn build(config: FederationConfig) -> Result<Self> {
        let data_dir = match config.data_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(d) => PathBuf::from(d),
            None => default_data_dir()?,
        };
        std::fs::create_dir_all(&data_dir).with_context(|| format!("create data dir: {}", data_dir.display()))?;
        let base_url = config.base_url();

        let metrics = Arc::new(FederationMetrics::new());
        let store = Arc::new(SqliteStore::open(data_dir.join("social.db"))?);
        let queue = Arc::new(SqliteJobQueue::open(
            data_dir.join("jobs.db"),
            QueueSettings {
                tick: config.worker_tick(),
                ..Default::default()
            },
            metrics.clone(),
        )?);
        for relay in &config.relays {
            store.add_relay(relay).with_context(|| format!("add relay {relay}"))?;
        }

        let identity = load_or_generate_identity(&data_dir)?;
        let instance = instance_actor(store.as_ref(), &base_url, &identity)?;

        let http = http_client(&config)?;
        let requests = SignedRequestBuilder::new(Arc::new(RsaSha256Signer));
        let tracker = Arc::new(FailureTracker::new(config.failure_days_threshold()));
        let breakers = Arc::new(CircuitBreakers::new(
            config.circuit_failure_threshold(),
            config.circuit_cool_off(),
        ));
        let fetcher: Arc<dyn ObjectFetcher> = Arc::new(HttpObjectFetcher::new(
            http.clone(),
            requests.clone(),
            SigningActor::for_actor(&instance),
            metrics.clone(),
        ));
        let verifier: Arc<dyn RequestVerifier> = Arc::new(HttpSignatureVerifier::new(
            store.clone(),
            KeyResolver::new(http.clone()),
            config.max_date_skew(),
        ));

        let jobs = Arc::new(FederationJobs {
            store: store.clone(),
            fetcher: fetcher.clone(),
            delivery: Delivery::new(
                http,
                store.clone(),
                tracker.clone(),
                breakers.clone(),
                requests,
                metrics.clone(),
            ),
            ingestor: Ingestor::new(
                store.clone(),
                Arc::new(StoreActivityHandler::new(store.clone(), &base_url)),
                queue.clone(),
                metrics.clone(),
            ),
            distributor: Distributor::new(
                store.clone(),
                queue.clone(),
                DistributionSettings {
                    batch_size: config.distribution_batch_size(),
                    sync_followers_threshold: config.sync_followers_threshold(),
                    synchronization_disabled: config.disable_followers_synchronization,
                },
            ),
            crawler: ReplyCrawler::new(
                store.clone(),
                fetcher.clone(),
                queue.clone(),
                metrics.clone(),
                &base_url,
                CrawlLimits {
                    max_items: config.max_crawl_items(),
                    max_pages: config.max_collection_pages(),
                    max_thread_depth: config.max_thread_depth(),
                },
            ),
            synchronizer: FollowersSynchronizer::new(
                store.clone(),
                fetcher,
                queue.clone(),
                &base_url,
                config.max_crawl_items(),
                config.max_collection_pages(),
            ),
        });

        let gate = InboxGate::new(
            store.clone(),
            verifier.clone(),
            queue.clone(),
            tracker.clone(),
            metrics.clone(),
            config.max_body_bytes(),
        );
        let state = AppState {
            store: store.clone(),
            gate: Arc::new(gate),
            verifier,
            metrics: metrics.clone(),
            max_body_bytes: config.max_body_bytes(),
        };

        info!("federation engine for {base_url}, data in {}", data_dir.display());
        Ok(Self {
            config,
            store,
            queue,
            metrics,
            tracker,
            breakers,
            instance_actor: instance,
            jobs,
            state,
        })
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Queues a distribution; audience resolution and fan-out happen in the worker.
    pub async fn distribute(&self, args: &DistributeArgs) -> Result<()> {
        enqueue_distribution(self.queue.as_ref(), args).await
    }

    /// Runs the job worker and the HTTP server until `shutdown` flips to true.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.queue
            .start_worker(shutdown.clone(), self.jobs.clone(), self.config.worker_concurrency());

        let addr: SocketAddr = self.config.bind.parse().context("parse bind")?;
        let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
        info!("federation server http://{addr}");

        let server_shutdown = async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        };
        axum::serve(listener, self.router().into_make_service())
            .with_graceful_shutdown(server_shutdown)
            .await
            .context("serve")?;
        Ok(())
    }
}

pub fn start(cfg: FederationConfig) -> Result<u64> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .try_init()
        .ok();

    let handle = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = thread::spawn(move || {
        if let Err(e) = run_federation(cfg, shutdown_rx) {
            error!("federation runtime failed: {e:#}");
        }
    });

    let mut reg = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    reg.push((
        handle,
        RunningFederation {
            shutdown_tx,
            join: Some(join),
        },
    ));
    Ok(handle)
}

pub fn stop(handle: u64) -> Result<()> {
    let running = {
        let mut reg = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = reg
            .iter()
            .position(|(h, _)| *h == handle)
            .context("invalid handle")?;
        let (_, mut running) = reg.swap_remove(idx);
        let _ = running.shutdown_tx.send(true);
        running.join.take()
    };

    if let Some(j) = running {
        thread::spawn(move || {
            let _ = j.join();
        });
    }
    Ok(())
}

fn run_federation(cfg: FederationConfig, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        let federation = tokio::task::spawn_blocking(move || Federation::build(cfg))
            .await
            .context("join build")??;
        federation.serve(shutdown_rx).await
    })
}
