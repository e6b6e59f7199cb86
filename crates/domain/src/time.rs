//! Time and timestamp helpers.

use chrono::{DateTime, Utc};

/// UTC timestamp stamped on envelopes and broker sessions.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_return_monotonic_enough_utc_time() {
        let first = now();
        let second = now();
        assert!(second >= first);
        assert_eq!(first.timezone(), Utc);
    }
}
