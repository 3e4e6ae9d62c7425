//! Overflow-free span arithmetic.
//!
//! Second counts arrive from config files, provider descriptors, pushed
//! records and permission rules. They are bounded by [`MAX_SPAN_SECS`] at
//! validation time, and every conversion below saturates instead of
//! panicking so an out-of-range value can never take the broker down.

use chrono::{DateTime, TimeDelta, Utc};

/// Longest span accepted anywhere: ten years.
pub const MAX_SPAN_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// `secs` as a chrono span, clamped to [`MAX_SPAN_SECS`].
pub fn span_secs(secs: u64) -> TimeDelta {
    let secs = i64::try_from(secs.min(MAX_SPAN_SECS)).unwrap_or(i64::MAX);
    TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX)
}

/// `at + span`, saturating at the end of the representable calendar.
pub fn add_span(at: DateTime<Utc>, span: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - span`, saturating at the start of the representable calendar.
pub fn sub_span(at: DateTime<Utc>, span: TimeDelta) -> DateTime<Utc> {
    at.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_is_clamped() {
        assert_eq!(span_secs(90), TimeDelta::seconds(90));
        assert_eq!(span_secs(u64::MAX), TimeDelta::seconds(MAX_SPAN_SECS as i64));
    }

    #[test]
    fn test_add_and_sub_saturate() {
        let far = DateTime::<Utc>::MAX_UTC - TimeDelta::seconds(10);
        assert_eq!(add_span(far, span_secs(3600)), DateTime::<Utc>::MAX_UTC);
        let early = DateTime::<Utc>::MIN_UTC + TimeDelta::seconds(10);
        assert_eq!(sub_span(early, span_secs(3600)), DateTime::<Utc>::MIN_UTC);

        let now = Utc::now();
        assert_eq!(add_span(now, span_secs(5)), now + TimeDelta::seconds(5));
        assert_eq!(sub_span(now, span_secs(5)), now - TimeDelta::seconds(5));
    }
}
