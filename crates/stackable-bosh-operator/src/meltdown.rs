//! Rate limits the work done for one object.
//!
//! The first reconcile of a burst only stamps a start marker on the object and requeues itself
//! for the end of the window. Reconciles arriving inside the window are dropped, the delayed
//! reconcile does the work for all of them. At most one unit of work is done per object and
//! window, however fast events arrive.

use std::time::Duration;

use k8s_openapi::chrono::{DateTime, TimeDelta, Utc};
use kube::api::ObjectMeta;

use crate::kvp::RECONCILE_START_ANNOTATION;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// A new window starts. Stamp the marker and requeue after the given delay.
    Delay(Duration),

    /// Inside the window. The pending delayed reconcile covers this event.
    Skip,

    /// Do the work. `clear_marker` is set when a window just ended.
    Proceed { clear_marker: bool },
}

/// Decides what a reconcile does, given the marker of the current window.
pub fn should_skip(marker: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> Decision {
    if window.is_zero() {
        return Decision::Proceed {
            clear_marker: marker.is_some(),
        };
    }
    let Some(start) = marker else {
        return Decision::Delay(window);
    };

    let end = TimeDelta::from_std(window)
        .ok()
        .and_then(|window| start.checked_add_signed(window));
    match end {
        Some(end) if now >= end => Decision::Proceed { clear_marker: true },
        _ => Decision::Skip,
    }
}

/// Time left until the window opened at `start` ends.
pub fn remaining(start: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> Duration {
    let elapsed = (now - start).to_std().unwrap_or_default();
    window.saturating_sub(elapsed)
}

/// Reads the window marker. An unparsable marker counts as absent.
pub fn marker(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    let value = meta.annotations.as_ref()?.get(RECONCILE_START_ANNOTATION)?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

pub fn stamp(meta: &mut ObjectMeta, now: DateTime<Utc>) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(RECONCILE_START_ANNOTATION.to_owned(), now.to_rfc3339());
}

pub fn clear(meta: &mut ObjectMeta) {
    if let Some(annotations) = &mut meta.annotations {
        annotations.remove(RECONCILE_START_ANNOTATION);
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0)
            .single()
            .expect("valid timestamp")
    }

    /// Feeds reconciles at the given offsets through the governor like a reconciler would.
    fn simulate(offsets: &[i64]) -> Vec<Decision> {
        let mut meta = ObjectMeta::default();
        offsets
            .iter()
            .map(|offset| {
                let now = at(*offset);
                let decision = should_skip(marker(&meta), now, WINDOW);
                match decision {
                    Decision::Delay(_) => stamp(&mut meta, now),
                    Decision::Proceed { clear_marker: true } => clear(&mut meta),
                    Decision::Proceed { .. } | Decision::Skip => {}
                }
                decision
            })
            .collect()
    }

    #[test]
    fn a_burst_is_coalesced_into_one_run() {
        let decisions = simulate(&[0, 1, 2, 11]);

        assert_eq!(
            decisions,
            vec![
                Decision::Delay(WINDOW),
                Decision::Skip,
                Decision::Skip,
                Decision::Proceed { clear_marker: true },
            ]
        );
        let scheduled = decisions
            .iter()
            .filter(|decision| matches!(decision, Decision::Delay(_)))
            .count();
        assert_eq!(scheduled, 1);
    }

    #[test]
    fn a_new_burst_opens_a_new_window() {
        let decisions = simulate(&[0, 10, 12, 13]);

        assert_eq!(
            decisions,
            vec![
                Decision::Delay(WINDOW),
                Decision::Proceed { clear_marker: true },
                Decision::Delay(WINDOW),
                Decision::Skip,
            ]
        );
    }

    #[rstest]
    #[case(None, Decision::Proceed { clear_marker: false })]
    #[case(Some(0), Decision::Proceed { clear_marker: true })]
    fn a_zero_window_always_proceeds(#[case] marker: Option<i64>, #[case] expected: Decision) {
        assert_eq!(
            should_skip(marker.map(at), at(1), Duration::ZERO),
            expected
        );
    }

    #[test]
    fn unparsable_markers_are_ignored() {
        let meta = ObjectMeta {
            annotations: Some(
                [(RECONCILE_START_ANNOTATION.to_owned(), "yesterday".to_owned())].into(),
            ),
            ..ObjectMeta::default()
        };

        assert_eq!(marker(&meta), None);
    }

    #[test]
    fn markers_round_trip_through_annotations() {
        let mut meta = ObjectMeta::default();

        stamp(&mut meta, at(5));
        assert_eq!(marker(&meta), Some(at(5)));

        clear(&mut meta);
        assert_eq!(marker(&meta), None);
    }

    #[rstest]
    #[case(0, Duration::from_secs(10))]
    #[case(3, Duration::from_secs(7))]
    #[case(12, Duration::ZERO)]
    fn remaining_time_counts_down(#[case] elapsed: i64, #[case] expected: Duration) {
        assert_eq!(remaining(at(0), at(elapsed), WINDOW), expected);
    }
}
