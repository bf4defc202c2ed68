/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::circuit_breaker::CircuitBreakers;
use crate::config::FederationConfig;
use crate::failure_tracker::DeliveryHealth;
use crate::followers_sync::build_header;
use crate::metrics::FederationMetrics;
use crate::signed_request::{SignedRequestBuilder, SigningActor};
use crate::store::FederationStore;
use anyhow::{anyhow, Context, Result};
use apfed_protocol::DeliverArgs;
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The inbox answered with a status that will never succeed.
    Unsalvageable(u16),
    /// Nothing was sent: the source actor is gone or cannot sign, or the inbox URL is malformed.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    #[error("host of {0} is unavailable")]
    Unavailable(String),
    #[error("{0:#}")]
    Retryable(#[from] anyhow::Error),
}

/// 501, or any 4xx except 401, 408 and 429.
pub fn response_error_unsalvageable(status: StatusCode) -> bool {
    if status == StatusCode::NOT_IMPLEMENTED {
        return true;
    }
    status.is_client_error()
        && !matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
}

/// The one pooled client shared by deliveries and fetches.
pub fn http_client(cfg: &FederationConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("apfed/", env!("CARGO_PKG_VERSION")))
        .timeout(cfg.http_timeout())
        .connect_timeout(cfg.http_connect_timeout())
        .pool_max_idle_per_host(cfg.http_pool_max_idle_per_host())
        .build()
        .context("build http client")
}

#[derive(Clone)]
pub struct Delivery {
    client: reqwest::Client,
    store: Arc<dyn FederationStore>,
    health: Arc<dyn DeliveryHealth>,
    breakers: Arc<CircuitBreakers>,
    requests: SignedRequestBuilder,
    metrics: Arc<FederationMetrics>,
}

impl Delivery {
    pub fn new(
        client: reqwest::Client,
        store: Arc<dyn FederationStore>,
        health: Arc<dyn DeliveryHealth>,
        breakers: Arc<CircuitBreakers>,
        requests: SignedRequestBuilder,
        metrics: Arc<FederationMetrics>,
    ) -> Self {
        Self {
            client,
            store,
            health,
            breakers,
            requests,
            metrics,
        }
    }

    /// One signed POST of `args.body` to `args.inbox_url`.
    pub async fn deliver(&self, args: &DeliverArgs) -> Result<DeliveryOutcome, DeliveryError> {
        let inbox = args.inbox_url.trim();
        if reqwest::Url::parse(inbox).is_err() {
            debug!("deliver: malformed inbox url {inbox:?}");
            return Ok(self.skipped());
        }
        if !self.health.available(inbox) {
            FederationMetrics::incr(&self.metrics.deliveries_skipped);
            return Err(DeliveryError::Unavailable(inbox.to_string()));
        }
        let Some(source) = self.store.actor(args.source_actor_id)? else {
            debug!("deliver: source actor {} vanished", args.source_actor_id);
            return Ok(self.skipped());
        };
        let Some(signer) = SigningActor::for_actor(&source) else {
            debug!("deliver: no signing key for {}", source.uri);
            return Ok(self.skipped());
        };
        let sync = if args.options.synchronize_followers {
            build_header(self.store.as_ref(), &source, inbox)?
        } else {
            None
        };
        let req = self
            .requests
            .post(&signer, inbox, args.body.as_bytes(), sync.as_ref())?;

        if let Err(open) = self.breakers.acquire(inbox) {
            FederationMetrics::incr(&self.metrics.deliveries_short_circuited);
            return Err(DeliveryError::CircuitOpen(open.key));
        }

        let resp = match req.to_reqwest(&self.client).send().await {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    self.metrics.http_timeout();
                } else {
                    self.metrics.http_error();
                }
                return Err(self.failed(inbox, anyhow!(e).context(format!("POST {inbox}"))));
            }
        };

        let status = resp.status();
        if status.is_success() {
            self.breakers.record_success(inbox);
            self.health.track_success(inbox);
            FederationMetrics::incr(&self.metrics.deliveries_ok);
            return Ok(DeliveryOutcome::Delivered);
        }

        let text = resp.text().await.unwrap_or_default();
        if response_error_unsalvageable(status) {
            // The host answered, so it is up; the breaker still counts it.
            self.breakers.record_failure(inbox);
            self.health.track_success(inbox);
            FederationMetrics::incr(&self.metrics.deliveries_unsalvageable);
            debug!("deliver {inbox}: unsalvageable {status}");
            return Ok(DeliveryOutcome::Unsalvageable(status.as_u16()));
        }

        Err(self.failed(inbox, anyhow!("POST {inbox}: http {status}: {}", truncate(&text, 256))))
    }

    fn skipped(&self) -> DeliveryOutcome {
        FederationMetrics::incr(&self.metrics.deliveries_skipped);
        DeliveryOutcome::Skipped
    }

    fn failed(&self, inbox: &str, err: anyhow::Error) -> DeliveryError {
        self.breakers.record_failure(inbox);
        self.health.track_failure(inbox);
        FederationMetrics::incr(&self.metrics.deliveries_failed);
        let msg = format!("{err:#}");
        warn!("delivery failed: {msg}");
        self.metrics.set_last_delivery_error(msg);
        DeliveryError::Retryable(err)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
