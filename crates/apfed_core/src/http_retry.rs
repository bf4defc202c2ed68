/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Short in-call retries for fetches. Deliveries do not use this; their
//! retries belong to the job queue.

use anyhow::{anyhow, Result};
use rand::{thread_rng, Rng};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::{Duration, SystemTime};

use crate::metrics::FederationMetrics;

const MAX_WAIT: Duration = Duration::from_secs(5);

/// Sends the request built by `build`, retrying 429/5xx and transport errors
/// up to `attempts` times. A `Retry-After` within [`MAX_WAIT`] is honored.
pub async fn send_with_retry_metrics<F>(
    mut build: F,
    attempts: u32,
    metrics: &FederationMetrics,
) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Backoff::new();
    for attempt in 1..=max_attempts {
        let last = attempt == max_attempts;
        match build().send().await {
            Ok(resp) if should_retry_status(resp.status()) && !last => {
                metrics.http_error();
                let hinted = retry_after(resp.headers(), SystemTime::now());
                match hinted {
                    Some(wait) if wait > MAX_WAIT => return Ok(resp),
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => backoff.wait().await,
                }
            }
            Ok(resp) => {
                if should_retry_status(resp.status()) {
                    metrics.http_error();
                }
                return Ok(resp);
            }
            Err(e) => {
                if e.is_timeout() {
                    metrics.http_timeout();
                } else {
                    metrics.http_error();
                }
                if last {
                    return Err(e.into());
                }
                backoff.wait().await;
            }
        }
    }
    Err(anyhow!("no attempt made"))
}

pub fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// `Retry-After` as a delay from `now`; accepts delta-seconds and HTTP dates.
pub fn retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(raw).ok()?;
    Some(at.duration_since(now).unwrap_or_default())
}

struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: Duration::from_millis(200),
        }
    }

    async fn wait(&mut self) {
        let jitter = Duration::from_millis(thread_rng().gen_range(0..=200));
        tokio::time::sleep(self.next + jitter).await;
        self.next = self.next.saturating_mul(2).min(MAX_WAIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn retryable_statuses() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::BAD_GATEWAY));
        assert!(!should_retry_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn retry_after_forms() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut h = HeaderMap::new();
        assert_eq!(retry_after(&h, now), None);
        h.insert(RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(retry_after(&h, now), Some(Duration::from_secs(3)));
        let later = httpdate::fmt_http_date(now + Duration::from_secs(90));
        h.insert(RETRY_AFTER, later.parse().unwrap());
        assert_eq!(retry_after(&h, now), Some(Duration::from_secs(90)));
        let past = httpdate::fmt_http_date(now - Duration::from_secs(90));
        h.insert(RETRY_AFTER, past.parse().unwrap());
        assert_eq!(retry_after(&h, now), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn long_retry_after_is_returned_to_the_caller() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3600"))
            .expect(1)
            .mount(&server)
            .await;
        let client = reqwest::Client::new();
        let metrics = FederationMetrics::new();
        let url = format!("{}/obj", server.uri());
        let resp = send_with_retry_metrics(|| client.get(&url), 3, &metrics).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/obj"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/obj"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let metrics = FederationMetrics::new();
        let url = format!("{}/obj", server.uri());
        let resp = send_with_retry_metrics(|| client.get(&url), 3, &metrics)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(metrics.http_errors.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
