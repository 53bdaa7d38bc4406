use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use credmux_classify::ClassifiedError;
use credmux_common::{Clock, ModelId, UnixSeconds};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::entry::LedgerEntry;
use crate::formula::cooldown_seconds;
use crate::lease::Lease;
use crate::{persistence, LedgerError, UsageSummary};

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// `None` disables persistence entirely (used by tests and by ephemeral
    /// callers that only want the in-memory rotation behavior).
    pub path: Option<PathBuf>,
    pub retention_days: u32,
    pub debounce: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: None,
            retention_days: 30,
            debounce: Duration::from_millis(500),
        }
    }
}

/// The persistent per-credential usage ledger (spec.md §4.B). All mutating
/// operations are atomic with respect to the single internal lock guarding
/// the in-memory map; persistence is write-through-on-mutation with a
/// bounded debounce so bursts of mutations coalesce into one disk write.
pub struct UsageLedger {
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
    state: Mutex<HashMap<String, LedgerEntry>>,
    /// Signaled by `release` and by cooldown expiry checks so `acquire`
    /// waiters re-evaluate eligibility instead of sleeping past it.
    wake: Notify,
    /// Signaled on every mutation; the persistence task debounces on this.
    dirty: Notify,
}

impl UsageLedger {
    pub async fn load(clock: Arc<dyn Clock>, config: LedgerConfig) -> Arc<Self> {
        let initial = match &config.path {
            Some(path) => persistence::load(path).await,
            None => HashMap::new(),
        };

        let ledger = Arc::new(Self {
            clock,
            config,
            state: Mutex::new(initial),
            wake: Notify::new(),
            dirty: Notify::new(),
        });

        if ledger.config.path.is_some() {
            let weak = Arc::downgrade(&ledger);
            let debounce = ledger.config.debounce;
            tokio::spawn(async move {
                loop {
                    let Some(ledger) = weak.upgrade() else { return };
                    ledger.dirty.notified().await;
                    tokio::time::sleep(debounce).await;
                    if let Some(ledger) = weak.upgrade() {
                        ledger.flush().await;
                    }
                }
            });
        }

        ledger
    }

    /// Forces an immediate write regardless of the debounce window. Called
    /// on graceful shutdown (spec.md §3 Lifecycles).
    pub async fn flush(&self) {
        let Some(path) = &self.config.path else {
            return;
        };
        let snapshot = self.state.lock().await.clone();
        if let Err(err) = persistence::save(path, &snapshot).await {
            tracing::warn!(error = %err, "failed to flush ledger to disk");
        }
    }

    fn mark_dirty(&self) {
        if self.config.path.is_some() {
            self.dirty.notify_one();
        }
    }

    fn today(&self) -> String {
        self.clock.today().to_string()
    }

    /// Selects one credential from `candidates` eligible for `model`,
    /// leasing it, per the ranking in spec.md §4.B. Waits on eligibility
    /// (signaled by `release` and cooldown expiry) until `deadline`.
    pub async fn acquire(
        self: &Arc<Self>,
        candidates: &[String],
        model: &ModelId,
        deadline: Instant,
    ) -> Result<Lease, LedgerError> {
        let model_key = model.qualified();
        let today = self.today();

        loop {
            let now = self.clock.now_unix();
            let mut earliest_wake: Option<UnixSeconds> = None;
            let chosen = {
                let mut guard = self.state.lock().await;
                for credential in candidates {
                    guard
                        .entry(credential.clone())
                        .or_insert_with(|| LedgerEntry::new(today.clone()))
                        .rollover_if_needed(&today, self.config.retention_days);
                }

                let mut best: Option<(&String, (i64, u32, i64, u64))> = None;
                for credential in candidates {
                    let entry = guard.get(credential).expect("inserted above");
                    if entry.is_cooling(&model_key, now) {
                        if let Some(until) = entry.model_cooldowns.get(&model_key) {
                            earliest_wake = Some(earliest_wake.map_or(*until, |w| w.min(*until)));
                        }
                        if let Some(until) = entry.disabled_until {
                            earliest_wake = Some(earliest_wake.map_or(until, |w| w.min(until)));
                        }
                        continue;
                    }
                    let key = (
                        entry.in_flight_for(&model_key),
                        entry.consecutive_failures_for(&model_key),
                        entry.last_success_at_for(&model_key),
                        stable_hash(credential),
                    );
                    if best.as_ref().is_none_or(|(_, best_key)| key < *best_key) {
                        best = Some((credential, key));
                    }
                }
                best.map(|(credential, _)| credential.clone())
            };

            if let Some(credential) = chosen {
                let mut guard = self.state.lock().await;
                let entry = guard.get_mut(&credential).expect("inserted above");
                *entry.in_flight.entry(model_key.clone()).or_insert(0) += 1;
                drop(guard);
                self.mark_dirty();
                return Ok(Lease::new(Arc::clone(self), credential, model.clone()));
            }

            let now_instant = Instant::now();
            if now_instant >= deadline {
                return Err(LedgerError::NoCredentialsAvailable);
            }

            let wake_at = match earliest_wake {
                Some(unix) => {
                    let delta = (unix - now).max(0) as u64;
                    let candidate = now_instant + Duration::from_secs(delta);
                    candidate.min(deadline)
                }
                // Nothing is cooling but nothing is eligible either: every
                // candidate must already hold the max concurrent lease a
                // caller would reasonably want. Poll rather than block
                // forever; `release` will usually wake us sooner anyway.
                None => (now_instant + Duration::from_millis(200)).min(deadline),
            };

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    pub(crate) async fn release(&self, credential: &str, model: &ModelId) {
        let model_key = model.qualified();
        {
            let mut guard = self.state.lock().await;
            if let Some(entry) = guard.get_mut(credential)
                && let Some(count) = entry.in_flight.get_mut(&model_key)
            {
                *count = (*count - 1).max(0);
            }
        }
        self.mark_dirty();
        self.wake.notify_waiters();
    }

    pub async fn record_success(&self, credential: &str, model: &ModelId, usage: Option<UsageSummary>) {
        let model_key = model.qualified();
        let today = self.today();
        let now = self.clock.now_unix();
        let (prompt, completion) = usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        let mut guard = self.state.lock().await;
        let entry = guard
            .entry(credential.to_string())
            .or_insert_with(|| LedgerEntry::new(today.clone()));
        entry.rollover_if_needed(&today, self.config.retention_days);
        entry.record_success(&model_key, prompt, completion, now);
        drop(guard);
        self.mark_dirty();
    }

    pub async fn record_failure(&self, credential: &str, model: &ModelId, classified: &ClassifiedError) {
        let model_key = model.qualified();
        let today = self.today();
        let now = self.clock.now_unix();

        let mut guard = self.state.lock().await;
        let entry = guard
            .entry(credential.to_string())
            .or_insert_with(|| LedgerEntry::new(today.clone()));
        entry.rollover_if_needed(&today, self.config.retention_days);

        let streak = entry.record_failure_counts(&model_key, classified.kind, now);
        let cooldown = cooldown_seconds(classified.kind, streak, classified.retry_after_seconds);
        if cooldown > 0 {
            let candidate_end = now + cooldown;
            let existing = entry.model_cooldowns.get(&model_key).copied().unwrap_or(0);
            entry
                .model_cooldowns
                .insert(model_key.clone(), existing.max(candidate_end));
        }

        if classified.kind == credmux_classify::ErrorKind::Auth {
            let candidate_end = now + 86_400;
            let existing = entry.disabled_until.unwrap_or(0);
            entry.disabled_until = Some(existing.max(candidate_end));
        }
        drop(guard);
        self.mark_dirty();
    }

    /// Read-only snapshot for observability. Callers never see
    /// partially-updated state because the copy happens under the lock.
    pub async fn snapshot(&self) -> HashMap<String, LedgerEntry> {
        self.state.lock().await.clone()
    }
}

fn stable_hash(credential: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    credential.hash(&mut hasher);
    hasher.finish()
}
