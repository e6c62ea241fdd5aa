/// Exponentially weighted round-trip-time estimator, the classic Jacobson
/// scheme with gain 1/8 implemented with shifts.
///
/// Each acked reliable command contributes one sample: the receive time of the
/// ack minus the send timestamp echoed inside it. The retransmission deadline
/// scales with the send count, so every failed attempt backs the next one off.
pub struct RttEstimator {
    mean_ms: u64,
    deviation_ms: u64,
    lowest_ms: u64,
    highest_deviation_ms: u64,
}

pub const INITIAL_RTT_MS: u64 = 300;
pub const INITIAL_DEVIATION_MS: u64 = 1;

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator {
            mean_ms: INITIAL_RTT_MS,
            deviation_ms: INITIAL_DEVIATION_MS,
            lowest_ms: INITIAL_RTT_MS,
            highest_deviation_ms: 0,
        }
    }

    pub fn on_sample(&mut self, sample_ms: u64) {
        let previous_mean = self.mean_ms;

        self.mean_ms -= self.mean_ms >> 3;
        self.mean_ms += sample_ms >> 3;

        self.deviation_ms -= self.deviation_ms >> 3;
        self.deviation_ms += sample_ms.abs_diff(previous_mean) >> 3;

        self.lowest_ms = self.lowest_ms.min(self.mean_ms);
        self.highest_deviation_ms = self.highest_deviation_ms.max(self.deviation_ms);
    }

    /// Deadline after which a reliable command sent for the `send_count`-th
    /// time is considered lost.
    pub fn retransmit_deadline(&self, now: u64, send_count: u32) -> u64 {
        now + (self.mean_ms + 4 * self.deviation_ms) * send_count as u64
    }

    pub fn mean_ms(&self) -> u64 {
        self.mean_ms
    }

    pub fn deviation_ms(&self) -> u64 {
        self.deviation_ms
    }

    pub fn lowest_ms(&self) -> u64 {
        self.lowest_ms
    }

    pub fn highest_deviation_ms(&self) -> u64 {
        self.highest_deviation_ms
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::below_initial(50)]
    #[case::at_initial(300)]
    #[case::above_initial(800)]
    fn test_converges_towards_constant_rtt(#[case] rtt: u64) {
        let mut estimator = RttEstimator::new();
        for _ in 0..200 {
            estimator.on_sample(rtt);
        }
        assert!(
            estimator.mean_ms().abs_diff(rtt) <= rtt / 10 + 8,
            "mean {} did not converge towards {}",
            estimator.mean_ms(),
            rtt
        );
        assert!(
            estimator.deviation_ms() <= 8,
            "deviation {} did not converge towards zero",
            estimator.deviation_ms()
        );
    }

    #[test]
    fn test_lowest_rtt_tracks_mean_minimum() {
        let mut estimator = RttEstimator::new();
        for _ in 0..100 {
            estimator.on_sample(40);
        }
        let low = estimator.lowest_ms();
        assert!(low < INITIAL_RTT_MS);

        for _ in 0..100 {
            estimator.on_sample(500);
        }
        assert_eq!(estimator.lowest_ms(), low, "watermark must not move back up");
        assert!(estimator.highest_deviation_ms() > 0);
    }

    #[test]
    fn test_deadline_scales_with_send_count() {
        let estimator = RttEstimator::new();
        let single = estimator.retransmit_deadline(1000, 1) - 1000;
        let triple = estimator.retransmit_deadline(1000, 3) - 1000;
        assert_eq!(triple, 3 * single);
        assert_eq!(single, INITIAL_RTT_MS + 4 * INITIAL_DEVIATION_MS);
    }
}
