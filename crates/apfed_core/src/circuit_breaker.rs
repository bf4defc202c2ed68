/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-key circuit breakers (one per inbox URL).
//!
//! CLOSED counts consecutive failures; at `threshold` the breaker OPENs and
//! every call is refused without touching the network. After `cool_off` the
//! next caller is let through as the single HALF-OPEN trial. Its outcome
//! closes the breaker or reopens it for another cool-off.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
#[error("circuit open for {key}")]
pub struct CircuitOpen {
    pub key: String,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }
}

pub struct CircuitBreakers {
    threshold: u32,
    cool_off: Duration,
    entries: RwLock<HashMap<String, Arc<Mutex<Breaker>>>>,
}

fn lock(m: &Mutex<Breaker>) -> MutexGuard<'_, Breaker> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CircuitBreakers {
    pub fn new(threshold: u32, cool_off: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cool_off,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<Breaker>> {
        {
            let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(b) = map.get(key) {
                return b.clone();
            }
        }
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new())))
            .clone()
    }

    /// Permission to make one call. Every granted call must be followed by
    /// `record_success` or `record_failure`.
    pub fn acquire(&self, key: &str) -> Result<(), CircuitOpen> {
        self.acquire_at(key, Instant::now())
    }

    pub fn acquire_at(&self, key: &str, now: Instant) -> Result<(), CircuitOpen> {
        let entry = self.entry(key);
        let mut b = lock(&entry);
        let refused = || CircuitOpen { key: key.to_string() };
        match b.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened = b.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened) >= self.cool_off {
                    b.state = CircuitState::HalfOpen;
                    b.trial_started_at = Some(now);
                    Ok(())
                } else {
                    Err(refused())
                }
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back stops blocking after one cool-off.
                let started = b.trial_started_at.unwrap_or(now);
                if b.trial_started_at.is_none() || now.saturating_duration_since(started) >= self.cool_off {
                    b.trial_started_at = Some(now);
                    Ok(())
                } else {
                    Err(refused())
                }
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let entry = self.entry(key);
        let mut b = lock(&entry);
        b.state = CircuitState::Closed;
        b.consecutive_failures = 0;
        b.opened_at = None;
        b.trial_started_at = None;
    }

    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, Instant::now())
    }

    pub fn record_failure_at(&self, key: &str, now: Instant) {
        let entry = self.entry(key);
        let mut b = lock(&entry);
        b.consecutive_failures = b.consecutive_failures.saturating_add(1);
        match b.state {
            CircuitState::Closed => {
                if b.consecutive_failures >= self.threshold {
                    b.state = CircuitState::Open;
                    b.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                b.state = CircuitState::Open;
                b.opened_at = Some(now);
                b.trial_started_at = None;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key)
            .map(|b| lock(b).state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn open_count(&self) -> usize {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        map.values()
            .filter(|b| lock(b).state != CircuitState::Closed)
            .count()
    }
}
