//! Completed-listen evaluation.

/// Returns true when enough of the track was heard to count as a listen.
///
/// Tracks with an unknown (zero) duration never count. The ratio check is
/// inclusive: exactly `min_ratio` of the track is enough.
pub fn is_completed(progress_ms: u64, duration_ms: u64, min_ratio: f64) -> bool {
    if duration_ms == 0 {
        return false;
    }
    (progress_ms as f64 / duration_ms as f64) >= min_ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_is_inclusive() {
        assert!(is_completed(160_000, 200_000, 0.8));
        assert!(!is_completed(159_999, 200_000, 0.8));
    }

    #[test]
    fn zero_duration_never_counts() {
        assert!(!is_completed(0, 0, 0.5));
        assert!(!is_completed(120_000, 0, 0.5));
    }

    #[test]
    fn progress_past_duration_counts() {
        assert!(is_completed(210_000, 200_000, 1.0));
    }
}
