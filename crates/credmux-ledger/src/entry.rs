use std::collections::HashMap;

use credmux_classify::ErrorKind;
use credmux_common::UnixSeconds;
use serde::{Deserialize, Serialize};

/// Per-model success/failure/token counters. Shared shape for both the
/// rolling daily bucket and the cumulative `global` counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCounters {
    pub success_count: u64,
    pub failure_count: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl ModelCounters {
    fn add_usage(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
    }
}

/// A single calendar day's counters, keyed by qualified model id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBucket {
    pub date: String,
    pub models: HashMap<String, ModelCounters>,
}

impl DailyBucket {
    fn new(date: String) -> Self {
        Self {
            date,
            models: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub consecutive_failures: u32,
    pub first_failure_at: UnixSeconds,
    pub last_error_kind: ErrorKind,
}

/// Per-credential ledger state. Created lazily on first observation of a
/// credential, never destroyed at runtime (§3 Lifecycles).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub daily: DailyBucket,
    /// Bounded by `retention_days`; oldest entries are dropped on rollover.
    pub history: HashMap<String, DailyBucket>,
    pub global: HashMap<String, ModelCounters>,
    /// modelId -> unix time at which (credential, model) becomes usable again.
    pub model_cooldowns: HashMap<String, UnixSeconds>,
    pub failures: HashMap<String, FailureInfo>,
    pub in_flight: HashMap<String, i64>,
    /// Not part of spec.md's literal field list, but required by the
    /// acquire selection tuple ("...last_success_at asc...") in §4.B;
    /// tracked per (credential, model) alongside the other per-model maps.
    pub last_success_at: HashMap<String, UnixSeconds>,
    /// Set by `record_failure` on an `auth` classification: disables the
    /// credential for every model under its provider, not just the model
    /// that failed (spec.md §4.B: "marks the credential disabled for that
    /// provider for a long cooldown").
    pub disabled_until: Option<UnixSeconds>,
}

impl LedgerEntry {
    pub fn new(today: String) -> Self {
        Self {
            daily: DailyBucket::new(today.clone()),
            history: HashMap::new(),
            global: HashMap::new(),
            model_cooldowns: HashMap::new(),
            failures: HashMap::new(),
            in_flight: HashMap::new(),
            last_success_at: HashMap::new(),
            disabled_until: None,
        }
    }

    /// Rolls the daily bucket over into `history` if its date no longer
    /// matches `today`, bounded by `retention_days`. A no-op when already
    /// current. Invariant 3: `daily.date == today(ledger_clock)` must hold
    /// before any other read/write in a mutating operation.
    pub fn rollover_if_needed(&mut self, today: &str, retention_days: u32) {
        if self.daily.date == today {
            return;
        }
        let finished = std::mem::replace(&mut self.daily, DailyBucket::new(today.to_string()));
        self.history.insert(finished.date.clone(), finished);

        if self.history.len() > retention_days as usize {
            let mut dates: Vec<&String> = self.history.keys().collect();
            dates.sort();
            let overflow = dates.len() - retention_days as usize;
            let to_drop: Vec<String> = dates.into_iter().take(overflow).cloned().collect();
            for date in to_drop {
                self.history.remove(&date);
            }
        }
    }

    pub fn in_flight_for(&self, model: &str) -> i64 {
        self.in_flight.get(model).copied().unwrap_or(0)
    }

    pub fn consecutive_failures_for(&self, model: &str) -> u32 {
        self.failures
            .get(model)
            .map(|f| f.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn last_success_at_for(&self, model: &str) -> UnixSeconds {
        self.last_success_at.get(model).copied().unwrap_or(0)
    }

    pub fn is_cooling(&self, model: &str, now: UnixSeconds) -> bool {
        self.model_cooldowns
            .get(model)
            .is_some_and(|until| now < *until)
            || self.disabled_until.is_some_and(|until| now < until)
    }

    pub fn record_success(&mut self, model: &str, prompt_tokens: u64, completion_tokens: u64, now: UnixSeconds) {
        self.daily
            .models
            .entry(model.to_string())
            .or_default()
            .add_usage(prompt_tokens, completion_tokens);
        self.daily.models.get_mut(model).unwrap().success_count += 1;

        let global = self.global.entry(model.to_string()).or_default();
        global.success_count += 1;
        global.add_usage(prompt_tokens, completion_tokens);

        if let Some(f) = self.failures.get_mut(model) {
            f.consecutive_failures = 0;
        }
        self.last_success_at.insert(model.to_string(), now);
    }

    /// Bumps failure counters for `model`, returning the new consecutive
    /// streak length.
    pub fn record_failure_counts(&mut self, model: &str, kind: ErrorKind, now: UnixSeconds) -> u32 {
        self.daily.models.entry(model.to_string()).or_default().failure_count += 1;
        self.global.entry(model.to_string()).or_default().failure_count += 1;

        let entry = self
            .failures
            .entry(model.to_string())
            .or_insert(FailureInfo {
                consecutive_failures: 0,
                first_failure_at: now,
                last_error_kind: kind,
            });
        entry.consecutive_failures += 1;
        entry.last_error_kind = kind;
        entry.consecutive_failures
    }
}
