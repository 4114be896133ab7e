use std::time::Duration;

/// Per-section access counters and rolling service-time averages.
///
/// Updated under the owning section's stats lock, never while a section
/// lock is held, so the `accesses == hits + misses` invariant holds at
/// every instant without serializing the slot tables.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SectionStats {
    pub accesses: u64,
    pub hits: u64,
    pub misses: u64,
    pub avg_hit_time_us: f64,
    pub avg_miss_time_us: f64,
}

impl SectionStats {
    pub fn miss_rate(&self) -> f64 {
        if self.accesses > 0 {
            self.misses as f64 / self.accesses as f64
        } else {
            0.0
        }
    }

    pub(crate) fn record_hit(&mut self, elapsed: Duration) {
        self.accesses += 1;
        self.hits += 1;
        let us = elapsed.as_secs_f64() * 1e6;
        self.avg_hit_time_us =
            (self.avg_hit_time_us * (self.hits - 1) as f64 + us) / self.hits as f64;
    }

    /// Misses are counted before any fallible step of the miss path; the
    /// service time is folded in separately once the install succeeds.
    pub(crate) fn record_miss(&mut self) {
        self.accesses += 1;
        self.misses += 1;
    }

    pub(crate) fn record_miss_time(&mut self, elapsed: Duration) {
        let us = elapsed.as_secs_f64() * 1e6;
        self.avg_miss_time_us =
            (self.avg_miss_time_us * (self.misses - 1) as f64 + us) / self.misses as f64;
    }

    /// Reclassifies the miss counted before the double-check as a hit:
    /// the page became resident while the miss path was preparing.
    pub(crate) fn record_hit_after_miss(&mut self, elapsed: Duration) {
        self.misses -= 1;
        self.hits += 1;
        let us = elapsed.as_secs_f64() * 1e6;
        self.avg_hit_time_us =
            (self.avg_hit_time_us * (self.hits - 1) as f64 + us) / self.hits as f64;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_rate_is_zero_without_accesses() {
        let stats = SectionStats::default();
        assert_eq!(stats.miss_rate(), 0.0);
    }

    #[test]
    fn counters_stay_consistent() {
        let mut stats = SectionStats::default();
        stats.record_hit(Duration::from_micros(10));
        stats.record_miss();
        stats.record_miss_time(Duration::from_micros(100));
        stats.record_hit(Duration::from_micros(30));

        assert_eq!(stats.accesses, stats.hits + stats.misses);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.avg_hit_time_us - 20.0).abs() < 1.0);
        assert!((stats.miss_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hit_after_miss_reclassifies() {
        let mut stats = SectionStats::default();
        stats.record_miss();
        stats.record_hit_after_miss(Duration::from_micros(10));

        assert_eq!(stats.accesses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.accesses, stats.hits + stats.misses);
    }

    #[test]
    fn reset_zeroes_everything() {
        let mut stats = SectionStats::default();
        stats.record_miss();
        stats.record_miss_time(Duration::from_micros(5));
        stats.reset();
        assert_eq!(stats, SectionStats::default());
    }
}
