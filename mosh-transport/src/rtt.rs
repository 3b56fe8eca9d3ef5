use mosh_wire::MoshWire;
use std::time::Duration;

/// `MIN_RTO`/`MAX_RTO` and the first-measurement special case are fixed by
/// the protocol (not tunable), unlike a generic RFC 6298 client which would
/// only clamp the final RTO.
pub const MIN_RTO: Duration = Duration::from_millis(50);
pub const MAX_RTO: Duration = Duration::from_millis(1000);
pub const RTT_ALPHA: f64 = 1.0 / 8.0;
pub const RTT_BETA: f64 = 1.0 / 4.0;

/// Jacobson/Karels SRTT/RTTVAR estimator (RFC 6298 shape), with the
/// protocol's own first-sample initialization: the very first measurement
/// sets `srtt = R`, `rttvar = R / 2` rather than starting from a guessed
/// default.
#[derive(Debug, Clone, Copy, MoshWire)]
pub struct RttEstimator {
    hit: bool,
    srtt: Duration,
    rttvar: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            hit: false,
            srtt: INITIAL_SRTT,
            rttvar: INITIAL_RTTVAR,
        }
    }

    /// Incorporates one round-trip sample. Callers must already have
    /// discarded samples outside the protocol's 5-second sanity bound
    /// before calling this.
    pub fn update(&mut self, sample: Duration) {
        if !self.hit {
            self.srtt = sample;
            self.rttvar = sample / 2;
            self.hit = true;
            return;
        }

        let diff = sample.abs_diff(self.srtt);
        self.rttvar = self.rttvar.mul_f64(1.0 - RTT_BETA) + diff.mul_f64(RTT_BETA);
        self.srtt = self.srtt.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA);
    }

    /// `ceil(SRTT + 4*RTTVAR)`, clamped to `[MIN_RTO, MAX_RTO]`.
    pub fn timeout(&self) -> Duration {
        (self.srtt + 4 * self.rttvar).clamp(MIN_RTO, MAX_RTO)
    }

    pub fn srtt(&self) -> Duration {
        self.srtt
    }
}

const INITIAL_SRTT: Duration = Duration::from_millis(1000);
const INITIAL_RTTVAR: Duration = Duration::from_millis(500);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initializes_srtt_and_half_rttvar() {
        let mut est = RttEstimator::new();
        est.update(Duration::from_millis(100));
        assert_eq!(est.srtt(), Duration::from_millis(100));
    }

    #[test]
    fn timeout_is_clamped_to_protocol_bounds() {
        let mut est = RttEstimator::new();
        est.update(Duration::from_micros(1));
        assert!(est.timeout() >= MIN_RTO);

        est.update(Duration::from_secs(10));
        assert!(est.timeout() <= MAX_RTO);
    }
}
