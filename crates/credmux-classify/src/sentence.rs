/// Best-effort extraction of a retry hint from a free-text message, e.g.
/// "please try again in 12.5 seconds" or "retry in 2 minutes". Returns
/// whole seconds, rounding up fractional minutes/hours so we never retry
/// sooner than the provider actually asked for.
pub(crate) fn parse_retry_seconds(text: &str) -> Option<u64> {
    let lower = text.to_ascii_lowercase();
    let after = if let Some(idx) = lower.find("try again in") {
        &lower[idx + "try again in".len()..]
    } else if let Some(idx) = lower.find("retry in") {
        &lower[idx + "retry in".len()..]
    } else {
        return None;
    };
    let after = after.trim_start();

    let mut chars = after.char_indices();
    let mut end = 0;
    let mut seen_digit = false;
    for (i, c) in &mut chars {
        if c.is_ascii_digit() || c == '.' {
            seen_digit = true;
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    if !seen_digit {
        return None;
    }
    let number: f64 = after[..end].parse().ok()?;
    let rest = after[end..].trim_start();

    let multiplier = if rest.starts_with("ms") || rest.starts_with("millisecond") {
        0.001
    } else if rest.starts_with('m') && !rest.starts_with("ms") {
        60.0
    } else if rest.starts_with('h') {
        3600.0
    } else {
        1.0
    };

    Some((number * multiplier).ceil() as u64)
}
