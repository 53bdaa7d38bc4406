//! The persistent per-credential usage ledger and provider-scoped cooldown
//! controller (spec.md §4.B, §4.C). This crate owns the only shared mutable
//! state in the whole workspace that survives a process restart.

mod cooldown;
mod entry;
mod error;
mod formula;
mod ledger;
mod lease;
mod persistence;
mod usage;

pub use cooldown::CooldownController;
pub use entry::{DailyBucket, FailureInfo, LedgerEntry, ModelCounters};
pub use error::LedgerError;
pub use formula::cooldown_seconds;
pub use ledger::{LedgerConfig, UsageLedger};
pub use lease::Lease;
pub use usage::UsageSummary;
