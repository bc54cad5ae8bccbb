use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 64-bit UTC tick (100ns units since the unix epoch) used for the
/// `modified` and `modified_on_primary` row columns.
pub type UtcTicks = i64;

/// Sentinel meaning "no primary timestamp was captured".
pub const UTC_TICKS_NONE: UtcTicks = 0;

pub fn utc_now() -> UtcTicks {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_nanos() / 100) as i64,
        Err(_) => 0,
    }
}

pub fn ticks_to_duration(ticks: UtcTicks) -> Duration {
    Duration::from_nanos((ticks.max(0) as u64).saturating_mul(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_enough() {
        let a = utc_now();
        let b = utc_now();
        assert!(b >= a);
        assert!(a > 0);
    }
}
