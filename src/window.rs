use chrono::{DateTime, Duration, Utc};

/// 策略里的窗口长度 (`amount` 个 `unit_secs` 秒) 转成 `Duration`，越界时饱和而不是 panic
pub fn span(amount: i64, unit_secs: i64) -> Duration {
    amount
        .checked_mul(unit_secs)
        .and_then(Duration::try_seconds)
        .unwrap_or(if amount < 0 { Duration::MIN } else { Duration::MAX })
}

/// 在按时间排序的序列中找出"任意窗口内至少 `min_count` 条"的最大簇
///
/// 两个元素的时间差 `<= window` 视为同一窗口。只有互相重叠的合格窗口才会合并，
/// 相邻但不重叠的两段爆发各自成簇。输入必须已按时间非递减排序。
pub fn clusters<T, F>(items: &[T], min_count: usize, window: Duration, timestamp: F) -> Vec<Vec<&T>>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    if min_count == 0 || items.len() < min_count {
        return Vec::new();
    }
    let mut spans = Vec::new();
    let mut left = 0;
    for right in 0..items.len() {
        while left < right && timestamp(&items[right]) - timestamp(&items[left]) > window {
            left += 1;
        }
        if right - left + 1 >= min_count {
            push_span(&mut spans, left, right);
        }
    }
    collect_spans(items, &spans)
}

/// 记录一个合格窗口 `[left, right]`，与上一个窗口有交集时合并
///
/// 调用方按 `right` 递增的顺序推入，`left` 同样非递减。
pub(crate) fn push_span(spans: &mut Vec<(usize, usize)>, left: usize, right: usize) {
    match spans.last_mut() {
        Some(last) if left <= last.1 => last.1 = last.1.max(right),
        _ => spans.push((left, right)),
    }
}

pub(crate) fn collect_spans<'t, T>(items: &'t [T], spans: &[(usize, usize)]) -> Vec<Vec<&'t T>> {
    spans
        .iter()
        .map(|&(left, right)| items[left..=right].iter().collect())
        .collect()
}

/// 时间聚集度：落在同一窗口内的最大比例。没有时间戳时返回 `None`。
pub fn densest_window_fraction(timestamps: &[DateTime<Utc>], window: Duration) -> Option<f64> {
    if timestamps.is_empty() {
        return None;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort();
    let mut best = 0;
    let mut left = 0;
    for right in 0..sorted.len() {
        while left < right && sorted[right] - sorted[left] > window {
            left += 1;
        }
        best = best.max(right - left + 1);
    }
    Some(best as f64 / sorted.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[test]
    fn clusters_merge_overlapping_windows() {
        let times = vec![t(0), t(2), t(4), t(6), t(30), t(31), t(60)];
        let groups = clusters(&times, 3, Duration::minutes(5), |x| *x);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 4);
    }

    #[test]
    fn back_to_back_bursts_stay_separate() {
        let times = vec![t(0), t(1), t(2), t(60), t(61), t(62)];
        let groups = clusters(&times, 3, Duration::minutes(5), |x| *x);
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![3, 3]);
        assert_eq!(*groups[1][0], t(60));
    }

    #[test]
    fn negative_window_never_panics() {
        let times = vec![t(0), t(1), t(2)];
        assert!(clusters(&times, 2, Duration::minutes(-5), |x| *x).is_empty());
        assert_eq!(clusters(&times, 1, Duration::minutes(-5), |x| *x).len(), 3);
        let fraction = densest_window_fraction(&times, Duration::seconds(-1)).unwrap();
        assert!((fraction - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn span_saturates_instead_of_panicking() {
        assert_eq!(span(2, 3600), Duration::hours(2));
        assert_eq!(span(i64::MAX, 3600), Duration::MAX);
        assert_eq!(span(i64::MIN, 60), Duration::MIN);
    }

    #[test]
    fn clusters_need_min_count() {
        let times = vec![t(0), t(1)];
        assert!(clusters(&times, 3, Duration::minutes(5), |x| *x).is_empty());
        assert!(clusters(&times, 0, Duration::minutes(5), |x| *x).is_empty());
    }

    #[test]
    fn densest_fraction() {
        let times = vec![t(0), t(10), t(20), t(600)];
        let fraction = densest_window_fraction(&times, Duration::minutes(30)).unwrap();
        assert!((fraction - 0.75).abs() < 1e-9);
        assert_eq!(densest_window_fraction(&[], Duration::minutes(5)), None);
    }
}
