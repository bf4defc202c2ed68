/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::http_retry::send_with_retry_metrics;
use crate::http_sig::ACCEPT_ACTIVITY;
use crate::metrics::FederationMetrics;
use crate::signed_request::{SignedRequestBuilder, SigningActor};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// `None` when the object is gone (404/410 or a Tombstone).
    async fn fetch(&self, url: &str) -> Result<Option<Value>>;
}

/// Signed GET with a few quick retries on 429/5xx.
pub struct HttpObjectFetcher {
    http: reqwest::Client,
    requests: SignedRequestBuilder,
    signer: Option<SigningActor>,
    metrics: Arc<FederationMetrics>,
    attempts: u32,
}

impl HttpObjectFetcher {
    pub fn new(
        http: reqwest::Client,
        requests: SignedRequestBuilder,
        signer: Option<SigningActor>,
        metrics: Arc<FederationMetrics>,
    ) -> Self {
        Self {
            http,
            requests,
            signer,
            metrics,
            attempts: 3,
        }
    }
}

fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()?
        .host_str()
        .map(|h| h.to_ascii_lowercase())
}

pub fn is_tombstone(v: &Value) -> bool {
    v.get("type").and_then(|t| t.as_str()) == Some("Tombstone")
}

#[async_trait]
impl ObjectFetcher for HttpObjectFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<Value>> {
        let resp = match &self.signer {
            Some(actor) => {
                let req = self.requests.get(actor, url)?;
                send_with_retry_metrics(|| req.to_reqwest(&self.http), self.attempts, &self.metrics).await?
            }
            None => {
                send_with_retry_metrics(
                    || self.http.get(url).header("Accept", ACCEPT_ACTIVITY),
                    self.attempts,
                    &self.metrics,
                )
                .await?
            }
        };

        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("fetch {url}: http {status}"));
        }

        let bytes = resp.bytes().await?;
        let v: Value = serde_json::from_slice(&bytes).with_context(|| format!("parse json from {url}"))?;

        // The object must live where we fetched it from.
        let id = v
            .get("id")
            .and_then(|i| i.as_str())
            .ok_or_else(|| anyhow!("object without id at {url}"))?;
        if url_host(id).is_none() || url_host(id) != url_host(url) {
            return Err(anyhow!("object id {id} not on host of {url}"));
        }
        if is_tombstone(&v) {
            debug!("tombstone at {url}");
            return Ok(None);
        }
        Ok(Some(v))
    }
}
