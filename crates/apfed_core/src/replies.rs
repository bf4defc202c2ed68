/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Pulling remote conversation state: reply trees below a status and the
//! chain of ancestors above one.

use crate::collection::CollectionWalker;
use crate::ingest::{note_author, record_note, RecordedNote};
use crate::job_queue::{job_args, JobQueue};
use crate::metrics::FederationMetrics;
use crate::object_fetch::ObjectFetcher;
use crate::store::FederationStore;
use anyhow::Result;
use apfed_protocol::{FetchReplyArgs, JobKind};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub discovered: usize,
    pub fetch_failures: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlLimits {
    pub max_items: usize,
    pub max_pages: usize,
    pub max_thread_depth: u32,
}

impl Default for CrawlLimits {
    fn default() -> Self {
        Self {
            max_items: 1000,
            max_pages: 50,
            max_thread_depth: 50,
        }
    }
}

pub struct ReplyCrawler {
    store: Arc<dyn FederationStore>,
    fetcher: Arc<dyn ObjectFetcher>,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<FederationMetrics>,
    local_prefix: String,
    limits: CrawlLimits,
}

impl ReplyCrawler {
    pub fn new(
        store: Arc<dyn FederationStore>,
        fetcher: Arc<dyn ObjectFetcher>,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<FederationMetrics>,
        local_base_url: &str,
        limits: CrawlLimits,
    ) -> Self {
        Self {
            store,
            fetcher,
            queue,
            metrics,
            local_prefix: format!("{}/", local_base_url.trim_end_matches('/')),
            limits,
        }
    }

    fn is_local(&self, uri: &str) -> bool {
        uri.starts_with(&self.local_prefix)
    }

    /// Walks the reply tree below `root_uri`, queueing a `fetch_reply` job
    /// for every reply found. Bounded by `max_items` discovered replies.
    pub async fn crawl(&self, root_uri: &str) -> Result<CrawlReport> {
        let mut report = CrawlReport::default();
        let mut visited = HashSet::<String>::new();
        visited.insert(root_uri.to_string());
        let mut frontier = vec![root_uri.to_string()];
        let walker = CollectionWalker::new(self.fetcher.as_ref(), self.limits.max_items, self.limits.max_pages);

        while let Some(uri) = frontier.pop() {
            if report.discovered >= self.limits.max_items {
                break;
            }
            let obj = match self.fetcher.fetch(&uri).await {
                Ok(Some(v)) => v,
                Ok(None) => continue,
                Err(e) => {
                    debug!("crawl: fetch {uri} failed: {e:#}");
                    report.fetch_failures += 1;
                    continue;
                }
            };
            let Some(replies) = obj.get("replies") else {
                continue;
            };
            let ids = match walker.item_ids(replies).await {
                Ok(ids) => ids,
                Err(e) => {
                    debug!("crawl: replies of {uri} failed: {e:#}");
                    report.fetch_failures += 1;
                    continue;
                }
            };

            let mut batch = Vec::new();
            for id in ids {
                if report.discovered >= self.limits.max_items {
                    break;
                }
                if self.is_local(&id) || !visited.insert(id.clone()) {
                    continue;
                }
                report.discovered += 1;
                batch.push(job_args(&FetchReplyArgs { uri: id.clone() })?);
                frontier.push(id);
            }
            FederationMetrics::add(&self.metrics.crawl_discovered, batch.len() as u64);
            self.queue.enqueue_bulk(JobKind::FetchReply, batch).await?;
        }

        if report.discovered > 0 {
            info!(
                "crawl {root_uri}: {} replies discovered, {} fetch failures",
                report.discovered, report.fetch_failures
            );
        }
        Ok(report)
    }

    /// Fetches and records one remote note. None when it is gone, local,
    /// or its author cannot be resolved.
    pub async fn fetch_reply(&self, uri: &str) -> Result<Option<RecordedNote>> {
        if self.is_local(uri) {
            return Ok(None);
        }
        if let Some(existing) = self.store.status_by_uri(uri)? {
            let parent = match existing.in_reply_to_id {
                Some(id) => self.store.status(id)?,
                None => None,
            };
            return Ok(Some(RecordedNote {
                status: existing,
                parent,
                unknown_parent: None,
            }));
        }
        let Some(note) = self.fetcher.fetch(uri).await? else {
            return Ok(None);
        };
        let Some(author) = note_author(self.store.as_ref(), self.fetcher.as_ref(), &note).await? else {
            debug!("fetch_reply: no author for {uri}");
            return Ok(None);
        };
        // The object and its author must share an origin.
        if crate::followers_sync::origin_prefix(&author.uri) != crate::followers_sync::origin_prefix(uri) {
            debug!("fetch_reply: {uri} attributed to foreign author {}", author.uri);
            return Ok(None);
        }
        Ok(Some(record_note(self.store.as_ref(), &author, &note)?))
    }

    /// Records unknown ancestors of a thread, starting at `uri`, until a known
    /// status, a failure, or the depth limit. Returns how many were recorded.
    pub async fn resolve_thread(&self, uri: &str, depth: u32) -> Result<usize> {
        let mut recorded = 0usize;
        let mut next = Some(uri.to_string());
        let mut depth = depth;
        let mut seen = HashSet::<String>::new();

        while let Some(current) = next.take() {
            if depth >= self.limits.max_thread_depth || !seen.insert(current.clone()) {
                break;
            }
            if self.store.status_by_uri(&current)?.is_some() {
                break;
            }
            let note = match self.fetch_reply(&current).await {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(e) => {
                    debug!("resolve_thread: {current}: {e:#}");
                    break;
                }
            };
            recorded += 1;
            depth += 1;
            next = note.unknown_parent.filter(|p| !self.is_local(p));
        }
        Ok(recorded)
    }
}
