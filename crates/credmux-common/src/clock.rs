use time::OffsetDateTime;

use crate::UnixSeconds;

/// Abstracts "what time is it" so the ledger's day-rollover and cooldown
/// math can be driven deterministically in tests instead of racing the wall
/// clock. Production code uses [`SystemClock`]; tests construct a fixed
/// clock inline.
pub trait Clock: Send + Sync + 'static {
    fn now_unix(&self) -> UnixSeconds;

    fn today(&self) -> time::Date {
        OffsetDateTime::from_unix_timestamp(self.now_unix())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
            .date()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> UnixSeconds {
        OffsetDateTime::now_utc().unix_timestamp()
    }
}

/// A clock with a settable time, used by this workspace's test suites
/// (exported, not `#[cfg(test)]`, so downstream crates can drive it too).
#[derive(Debug)]
pub struct FixedClock(std::sync::atomic::AtomicI64);

impl FixedClock {
    pub fn new(now_unix: UnixSeconds) -> Self {
        Self(std::sync::atomic::AtomicI64::new(now_unix))
    }

    pub fn advance(&self, seconds: i64) {
        self.0.fetch_add(seconds, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, now_unix: UnixSeconds) {
        self.0.store(now_unix, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_unix(&self) -> UnixSeconds {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
