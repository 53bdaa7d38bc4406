use std::collections::HashMap;
use std::sync::Arc;

use credmux_common::{Clock, UnixSeconds};
use tokio::sync::Mutex;

/// Provider-scoped, in-memory-only global pauses. Derived state, never
/// persisted — a process restart simply forgets any outstanding provider
/// cooldown, which is acceptable since it is re-derived from the next
/// upstream signal.
///
/// Grounded on `original_source/src/rotator_library/cooldown_manager.py`'s
/// `CooldownManager`, translated from an `asyncio.Lock`-guarded dict into
/// a `tokio::sync::Mutex`-guarded map.
pub struct CooldownController {
    clock: Arc<dyn Clock>,
    cooldowns: Mutex<HashMap<String, UnixSeconds>>,
}

impl CooldownController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Sets `end := max(existing, now + seconds)`. Two concurrent calls for
    /// the same provider both observe an end-time >= each candidate
    /// (spec.md §5 ordering guarantee), because the whole read-modify-write
    /// happens under the single mutex.
    pub async fn start(&self, provider: &str, seconds: i64) {
        let end = self.clock.now_unix() + seconds;
        let mut guard = self.cooldowns.lock().await;
        let existing = guard.get(provider).copied().unwrap_or(0);
        if end > existing {
            guard.insert(provider.to_string(), end);
        }
    }

    pub async fn is_cooling(&self, provider: &str) -> bool {
        let guard = self.cooldowns.lock().await;
        guard
            .get(provider)
            .is_some_and(|end| self.clock.now_unix() < *end)
    }

    /// Seconds remaining, or 0 if the provider is not currently cooling.
    pub async fn remaining(&self, provider: &str) -> i64 {
        let guard = self.cooldowns.lock().await;
        match guard.get(provider) {
            Some(end) => (*end - self.clock.now_unix()).max(0),
            None => 0,
        }
    }

    /// Absolute unix time the provider becomes usable again, or `None`.
    pub async fn end_at(&self, provider: &str) -> Option<UnixSeconds> {
        let guard = self.cooldowns.lock().await;
        guard
            .get(provider)
            .copied()
            .filter(|end| *end > self.clock.now_unix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credmux_common::FixedClock;

    #[tokio::test]
    async fn concurrent_starts_take_the_max_end_time() {
        let clock = Arc::new(FixedClock::new(1_000));
        let controller = CooldownController::new(clock.clone());

        let a = controller.start("openai", 30);
        let b = controller.start("openai", 90);
        tokio::join!(a, b);

        assert_eq!(controller.remaining("openai").await, 90);
        assert!(controller.is_cooling("openai").await);
    }

    #[tokio::test]
    async fn expires_after_the_window() {
        let clock = Arc::new(FixedClock::new(1_000));
        let controller = CooldownController::new(clock.clone());
        controller.start("openai", 10).await;
        clock.advance(11);
        assert!(!controller.is_cooling("openai").await);
        assert_eq!(controller.remaining("openai").await, 0);
    }

    #[tokio::test]
    async fn shorter_cooldown_never_shortens_existing() {
        let clock = Arc::new(FixedClock::new(1_000));
        let controller = CooldownController::new(clock.clone());
        controller.start("openai", 90).await;
        controller.start("openai", 5).await;
        assert_eq!(controller.remaining("openai").await, 90);
    }
}
