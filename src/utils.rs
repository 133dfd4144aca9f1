use num::{One, traits::WrappingAdd};
use std::{env, time::Duration};

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + One + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::one());
    id
}

/// Read a millisecond duration from the environment, clamped to a minimum
fn env_duration_ms(name: &str, default_ms: u64, minimum_ms: u64) -> Duration {
    let ms = env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_ms)
        .max(minimum_ms);
    Duration::from_millis(ms)
}

fn env_count(name: &str, default: usize, minimum: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
        .max(minimum)
}

/// Minimum spacing between successive activations, from `PVDB_ACTIVATION_SPACING`
pub fn get_default_activation_spacing() -> Duration {
    env_duration_ms("PVDB_ACTIVATION_SPACING", 0, 0)
}

/// Fixed extra delay added after each activation, from `PVDB_ACTIVATION_DELAY`
pub fn get_default_activation_delay() -> Duration {
    env_duration_ms("PVDB_ACTIVATION_DELAY", 0, 0)
}

/// Scheduler worker threads, from `PVDB_WORKER_THREADS` (default 4)
pub fn get_default_worker_threads() -> usize {
    env_count("PVDB_WORKER_THREADS", 4, 1)
}

/// Upper bound on blocking threads, from `PVDB_MAX_BLOCKING_THREADS` (default 16)
pub fn get_default_max_blocking_threads() -> usize {
    env_count("PVDB_MAX_BLOCKING_THREADS", 16, 1)
}

/// Minimum spacing between coalesced link notifications, from
/// `PVDB_LINK_UPDATE_INTERVAL` (default 10ms)
pub fn get_default_link_update_interval() -> Duration {
    env_duration_ms("PVDB_LINK_UPDATE_INTERVAL", 10, 0)
}

/// How often unresolved links are retried, from `PVDB_LINK_RETRY_PERIOD`
/// (default 5s, never faster than 100ms)
pub fn get_default_link_retry_period() -> Duration {
    env_duration_ms("PVDB_LINK_RETRY_PERIOD", 5000, 100)
}

/// Escape the characters used as separators in text representations of values
pub fn escape_separators(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '=' => out.push_str("\\="),
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape_separators`] on a single element
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Split a comma-separated list, honouring backslash escapes
///
/// Each returned element is unescaped. An empty input yields a single empty
/// element, so that an empty string round-trips.
pub fn split_escaped(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => current.push('\n'),
                Some(other) => current.push(other),
                None => current.push('\\'),
            },
            ',' => items.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    items.push(current);
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        let nasty = "a,b\\c=d\ne";
        let escaped = escape_separators(nasty);
        assert!(!escaped.contains('\n'));
        assert_eq!(unescape(&escaped), nasty);
        assert_eq!(split_escaped(&escaped), vec![nasty.to_string()]);
    }

    #[test]
    fn split_lists() {
        assert_eq!(split_escaped("1,2,3"), vec!["1", "2", "3"]);
        assert_eq!(split_escaped(""), vec![""]);
        assert_eq!(split_escaped("x\\,y,z"), vec!["x,y", "z"]);
    }

    #[test]
    fn wrapping_ids() {
        let mut id = u8::MAX;
        assert_eq!(wrapping_inplace_add(&mut id), u8::MAX);
        assert_eq!(id, 0);
    }
}
