use credmux_classify::ErrorKind;
use rand::Rng;

/// Computes the cooldown length in seconds for a (credential, model)
/// failure, per the table in spec.md §4.B. `streak` is the consecutive
/// failure count *after* this failure has been counted (i.e. >= 1).
pub fn cooldown_seconds(kind: ErrorKind, streak: u32, retry_after_hint: Option<u64>) -> i64 {
    match kind {
        ErrorKind::RateLimit => {
            let base = retry_after_hint.unwrap_or(0).max(15) as f64;
            let jitter = rand::rng().random_range(0.9..=1.1);
            let mut seconds = (base * jitter).min(3600.0);
            // Open question (spec.md §9): the source is ambiguous about the
            // exact streak threshold for doubling; implemented literally as
            // "streak >= 3" per the distilled spec text.
            if streak >= 3 {
                seconds = (seconds * 2.0).min(86_400.0);
            }
            seconds.round() as i64
        }
        ErrorKind::ServerError => {
            let exp = 2f64.powi(streak.saturating_sub(1) as i32);
            ((60.0 * exp).min(900.0)) as i64
        }
        ErrorKind::Timeout => (30 * streak as i64).min(300),
        ErrorKind::Transport => (10 * streak as i64).min(120),
        ErrorKind::Auth => 86_400,
        ErrorKind::Unknown => {
            let exp = 2f64.powi(streak.saturating_sub(1) as i32);
            ((30.0 * exp).min(600.0)) as i64
        }
        ErrorKind::BadRequest | ErrorKind::ContextWindow => 0,
    }
}
