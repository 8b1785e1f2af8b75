//! Clock calibration (spec §4.4): reconciling local mtimes against the
//! server's notion of "now" so reconcile decisions aren't skewed by a
//! misconfigured system clock.

const SYMMETRIC_BUFFER_MS: i64 = 10_000;
const FUTURE_DATED_THRESHOLD_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy)]
pub struct ClockCalibrator {
    /// `serverTime - localTime`, in milliseconds, at calibration time.
    offset_ms: i64,
}

impl ClockCalibrator {
    pub fn new(offset_ms: i64) -> Self {
        Self { offset_ms }
    }

    /// Uncalibrated: assumes the local and server clocks agree. Used before
    /// the first `Status` call succeeds.
    pub fn unsynced() -> Self {
        Self { offset_ms: 0 }
    }

    pub fn calibrate(server_time_ms: i64, local_time_ms: i64) -> Self {
        Self {
            offset_ms: server_time_ms - local_time_ms,
        }
    }

    /// Local mtime shifted into the server's clock frame.
    pub fn adjust(&self, local_mtime_ms: i64) -> i64 {
        local_mtime_ms + self.offset_ms
    }

    /// A future-dated local file (adjusted mtime more than 60s ahead of
    /// "now") is always preserved: the user is assumed to have set it
    /// deliberately.
    pub fn is_future_dated(&self, local_mtime_ms: i64, now_ms: i64) -> bool {
        self.adjust(local_mtime_ms) - now_ms > FUTURE_DATED_THRESHOLD_MS
    }

    /// True if the (adjusted) local file is newer than the server's
    /// `modifiedAt` by more than the symmetric buffer — i.e. should be kept
    /// over a server download. Near-equal timestamps within the buffer
    /// prefer the server.
    pub fn is_local_newer(&self, local_mtime_ms: i64, server_modified_ms: i64) -> bool {
        self.adjust(local_mtime_ms) - server_modified_ms > SYMMETRIC_BUFFER_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjusts_local_time_by_offset() {
        let clock = ClockCalibrator::calibrate(10_000, 9_000);
        assert_eq!(clock.adjust(5_000), 6_000);
    }

    #[test]
    fn near_equal_timestamps_prefer_server() {
        let clock = ClockCalibrator::unsynced();
        // 5s ahead is within the 10s buffer: not "newer".
        assert!(!clock.is_local_newer(15_000, 10_000));
    }

    #[test]
    fn local_newer_beyond_buffer_wins() {
        let clock = ClockCalibrator::unsynced();
        assert!(clock.is_local_newer(30_000, 10_000));
    }

    #[test]
    fn future_dated_file_is_detected_and_preserved() {
        let clock = ClockCalibrator::unsynced();
        let now = 100_000;
        assert!(clock.is_future_dated(now + 120_000, now));
        assert!(!clock.is_future_dated(now + 10_000, now));
    }

    #[test]
    fn clock_skew_is_absorbed_by_offset() {
        // Local clock is 1 hour behind the server.
        let clock = ClockCalibrator::calibrate(3_600_000 + 5_000, 5_000);
        // A local write at local-time 5_000 reads as server-time 3_605_000,
        // matching a server modifiedAt of 3_600_000 within the buffer.
        assert!(!clock.is_local_newer(5_000, 3_600_000));
    }
}
