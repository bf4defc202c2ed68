/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod audience;
pub mod circuit_breaker;
pub mod collection;
pub mod config;
pub mod delivery;
pub mod distribution;
pub mod failure_tracker;
pub mod followers_sync;
pub mod http_retry;
pub mod http_sig;
pub mod inbox;
pub mod ingest;
pub mod job_queue;
pub mod jobs;
pub mod keys;
pub mod metrics;
pub mod object_fetch;
pub mod replies;
pub mod runtime;
pub mod server;
pub mod signed_request;
pub mod store;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
