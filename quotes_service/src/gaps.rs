/// gaps.rs — Missing-range detection over a stored time column
///
/// Given the observed bar times for `[t0, t1]`, produce the sub-ranges that
/// still need fetching. All endpoints are inclusive, matching the fetcher's
/// inclusive-at-both-ends contract.

/// Sub-ranges of `[t0, t1]` not covered by `times` (ascending bar opens).
pub fn find_gaps(times: &[i64], tf_ms: i64, t0: i64, t1: i64) -> Vec<(i64, i64)> {
    // No data at all: the entire range is one gap.
    if times.is_empty() {
        return vec![(t0, t1)];
    }

    let mut gaps = Vec::new();

    // Leading gap: everything before the first observed bar.
    let first = times[0];
    if first > t0 {
        gaps.push((t0, first - tf_ms));
    }

    // Holes between consecutive bars.
    for pair in times.windows(2) {
        let (cur, next) = (pair[0], pair[1]);
        if next > cur + tf_ms {
            gaps.push((cur + tf_ms, next - tf_ms));
        }
    }

    // Trailing gap: everything after the last observed bar.
    let last = times[times.len() - 1];
    if last + tf_ms <= t1 {
        gaps.push((last + tf_ms, t1));
    }

    gaps
}

#[cfg(test)]
mod tests {
    use super::*;

    const H1: i64 = 3_600_000;

    #[test]
    fn empty_series_is_one_gap() {
        assert_eq!(find_gaps(&[], H1, 0, 23 * H1), vec![(0, 23 * H1)]);
    }

    #[test]
    fn dense_series_has_no_gaps() {
        let times: Vec<i64> = (0..24).map(|i| i * H1).collect();
        assert!(find_gaps(&times, H1, 0, 23 * H1).is_empty());
    }

    #[test]
    fn leading_gap() {
        let times = vec![3 * H1, 4 * H1];
        assert_eq!(find_gaps(&times, H1, 0, 4 * H1), vec![(0, 2 * H1)]);
    }

    #[test]
    fn middle_gap() {
        let times = vec![0, H1, 4 * H1, 5 * H1];
        assert_eq!(find_gaps(&times, H1, 0, 5 * H1), vec![(2 * H1, 3 * H1)]);
    }

    #[test]
    fn trailing_gap() {
        let times = vec![0, H1];
        assert_eq!(find_gaps(&times, H1, 0, 5 * H1), vec![(2 * H1, 5 * H1)]);
    }

    #[test]
    fn all_three_gap_kinds_at_once() {
        let times = vec![2 * H1, 5 * H1];
        assert_eq!(
            find_gaps(&times, H1, 0, 8 * H1),
            vec![(0, H1), (3 * H1, 4 * H1), (6 * H1, 8 * H1)]
        );
    }

    #[test]
    fn trailing_bar_exactly_at_end_leaves_no_gap() {
        let times = vec![0, H1, 2 * H1];
        assert!(find_gaps(&times, H1, 0, 2 * H1).is_empty());
    }
}
