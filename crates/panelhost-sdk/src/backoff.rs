// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Exponential backoff for the reconnect loop.
//!
//! Base 1 s, multiplier 1.6, jitter 0.2, capped at 60 s. The first wait
//! after a reset is free unless a wait was forced.

use std::time::Duration;

use rand::Rng;

const BASE_DELAY_MS: f64 = 1_000.0;
const MULTIPLIER: f64 = 1.6;
const JITTER: f64 = 0.2;
const MAX_DELAY_MS: f64 = 60_000.0;

/// Reconnect pacing state. One instance lives for the duration of the
/// reconnect loop.
#[derive(Debug, Default)]
pub struct ExpoWait {
    /// Force a wait on the next cycle even if the backoff is fresh.
    pub force_wait: bool,
    attempts: u32,
}

impl ExpoWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset after a healthy period; the next cycle proceeds immediately.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.force_wait = false;
    }

    /// Delay for the next cycle, `None` when the cycle may proceed
    /// immediately. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts == 0 && !self.force_wait {
            self.attempts = 1;
            return Some(Duration::ZERO);
        }
        self.force_wait = false;
        let exp = self.attempts.saturating_sub(1).min(16);
        self.attempts = self.attempts.saturating_add(1);
        let raw = (BASE_DELAY_MS * MULTIPLIER.powi(exp as i32)).min(MAX_DELAY_MS);
        let jitter = rand::thread_rng().gen_range(-JITTER..=JITTER);
        let delay_ms = (raw * (1.0 + jitter)).max(0.0);
        Some(Duration::from_millis(delay_ms as u64))
    }

    /// Sleep out the next backoff step. Returns `false` when the cycle
    /// should re-check state instead of proceeding (never happens today;
    /// mirrors the loop contract).
    pub async fn wait(&mut self) -> bool {
        if let Some(delay) = self.next_delay() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        true
    }
}
