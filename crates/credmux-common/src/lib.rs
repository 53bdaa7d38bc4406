//! Shared identifiers and time primitives used across the credmux workspace.
//!
//! Kept dependency-free of tokio/axum on purpose: this crate is the thing
//! every other crate (including pure unit tests) can depend on without
//! pulling in an async runtime.

mod clock;
mod model;

pub use clock::{Clock, FixedClock, SystemClock};
pub use model::{ModelId, ModelIdError, ProviderTag};

/// Unix seconds, used everywhere a cooldown or expiry is stored or compared.
pub type UnixSeconds = i64;
