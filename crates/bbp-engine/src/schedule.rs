//! Multi-medium scheduling.
//!
//! Every medium has a persistence interval and a next persistence time. The
//! engine persists with the combined frequency of all writable media
//! (`1/T = 1/T1 + ... + 1/Tn`) and switches to the medium whose next time is
//! earliest whenever it starts a new full delta. Next times are relative to
//! each other; when the chosen one has drifted from the wall clock by more
//! than [`DRIFT_THRESHOLD`] all of them are shifted together.

use std::time::Duration;

use bbp_media::StorageMedium;
use bbp_types::SequenceNumbers;
use tracing::debug;

use crate::config::DRIFT_THRESHOLD;

/// A medium plus its scheduling state.
pub struct MediumSlot {
    pub medium: Box<dyn StorageMedium>,
    /// Epoch milliseconds.
    pub next_persistence_time: i64,
    /// Superseded delta ranges to delete the next time this medium commits.
    pub cleanup: Vec<SequenceNumbers>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl MediumSlot {
    pub fn new(medium: Box<dyn StorageMedium>, now: i64) -> Self {
        Self {
            medium,
            next_persistence_time: now,
            cleanup: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.medium.name()
    }

    /// How far the schedule lags behind `now`; negative when ahead.
    pub fn behind(&self, now: i64) -> i64 {
        now - self.next_persistence_time
    }

    /// Change the interval, keeping the medium proportionally as far ahead or
    /// behind as it was.
    pub fn set_interval(&mut self, interval: Duration, now: i64) {
        let old = millis(self.medium.persistence_interval());
        let new = millis(interval);
        if old == 0 {
            self.next_persistence_time = now + new;
        } else {
            let behind = i128::from(self.behind(now)) * i128::from(new) / i128::from(old);
            self.next_persistence_time = now - behind as i64;
        }
        self.medium.settings_mut().persistence_interval = interval;
        debug!(
            medium = %self.name(),
            interval_ms = new,
            next = self.next_persistence_time,
            "persistence interval changed"
        );
    }

    /// Queue `range` for deletion on the next commit. Empty and already
    /// queued ranges are ignored.
    pub fn schedule_cleanup(&mut self, range: SequenceNumbers) {
        if range.is_empty() || self.cleanup.iter().any(|r| r.first == range.first && r.current == range.current) {
            return;
        }
        self.cleanup.push(range);
    }

    /// Advance past the delta just taken.
    pub fn advance(&mut self) {
        self.next_persistence_time += millis(self.medium.persistence_interval());
    }
}

/// Index of the writable slot to use next, shifting every schedule when the
/// choice has drifted from `now`. `None` when nothing is writable.
pub fn select_next(slots: &mut [MediumSlot], now: i64) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, slot) in slots.iter().enumerate().filter(|(_, s)| s.medium.is_writable()) {
        let earlier = match best {
            None => true,
            Some(b) => slot.next_persistence_time < slots[b].next_persistence_time,
        };
        if earlier {
            best = Some(i);
        }
    }
    let best = best?;
    let adjustment = slots[best].behind(now);
    if adjustment.abs() > millis(DRIFT_THRESHOLD) {
        for slot in slots.iter_mut() {
            slot.next_persistence_time += adjustment;
        }
        debug!(adjustment_ms = adjustment, "shifted persistence schedules");
    }
    debug!(medium = %slots[best].name(), "selected medium");
    Some(best)
}

/// Combined interval of all writable media: `1 / sum(1 / Ti)`.
pub fn combined_interval(slots: &[MediumSlot]) -> Option<Duration> {
    let sum: f64 = slots
        .iter()
        .filter(|s| s.medium.is_writable())
        .map(|s| s.medium.persistence_interval().as_secs_f64())
        .filter(|t| *t > 0.0)
        .map(|t| 1.0 / t)
        .sum();
    if sum > 0.0 {
        Some(Duration::from_secs_f64(1.0 / sum))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbp_media::{MediumSettings, NoOpMedium};

    fn slot(name: &str, interval_s: u64, next: i64) -> MediumSlot {
        let mut settings = MediumSettings::new(name);
        settings.persistence_interval = Duration::from_secs(interval_s);
        let mut s = MediumSlot::new(Box::new(NoOpMedium::new(settings)), 0);
        s.next_persistence_time = next;
        s
    }

    #[test]
    fn combined_frequency_is_the_sum() {
        let slots = vec![slot("a", 4, 0), slot("b", 4, 0), slot("c", 2, 0)];
        assert_eq!(combined_interval(&slots), Some(Duration::from_secs(1)));
        let mut ro = vec![slot("a", 10, 0)];
        ro[0].medium.settings_mut().writable = false;
        assert_eq!(combined_interval(&ro), None);
    }

    #[test]
    fn cleanup_ranges_accumulate() {
        let mut s = slot("a", 10, 0);
        s.schedule_cleanup(SequenceNumbers::new(1, 4, 10));
        s.schedule_cleanup(SequenceNumbers::new(5, 5, 20));
        s.schedule_cleanup(SequenceNumbers::new(1, 4, 30));
        s.schedule_cleanup(SequenceNumbers::new(6, 9, 40));
        let ranges: Vec<_> = s.cleanup.iter().map(|r| (r.first, r.current)).collect();
        assert_eq!(ranges, vec![(1, 4), (6, 9)]);
    }

    #[test]
    fn earliest_wins_without_drift() {
        let now = 1_000_000;
        let mut slots = vec![slot("a", 10, now + 2_000), slot("b", 40, now + 1_000)];
        assert_eq!(select_next(&mut slots, now), Some(1));
        assert_eq!(slots[0].next_persistence_time, now + 2_000);
    }

    #[test]
    fn drift_shifts_every_schedule() {
        let now = 1_000_000;
        let mut slots = vec![slot("a", 10, now - 60_000), slot("b", 40, now - 30_000)];
        assert_eq!(select_next(&mut slots, now), Some(0));
        assert_eq!(slots[0].next_persistence_time, now);
        assert_eq!(slots[1].next_persistence_time, now + 30_000);
        assert!(select_next(&mut [], now).is_none());
    }

    #[test]
    fn read_only_media_are_never_selected() {
        let now = 1_000_000;
        let mut slots = vec![slot("a", 10, now - 1_000), slot("b", 10, now)];
        slots[0].medium.settings_mut().writable = false;
        assert_eq!(select_next(&mut slots, now), Some(1));
        slots[1].medium.settings_mut().writable = false;
        assert_eq!(select_next(&mut slots, now), None);
    }

    #[test]
    fn interval_change_is_proportional() {
        let now = 1_000_000;
        let mut s = slot("a", 10, now - 4_000);
        s.set_interval(Duration::from_secs(20), now);
        assert_eq!(s.behind(now), 8_000);
        assert_eq!(s.medium.persistence_interval(), Duration::from_secs(20));

        let mut ahead = slot("b", 10, now + 5_000);
        ahead.set_interval(Duration::from_secs(5), now);
        assert_eq!(ahead.behind(now), -2_500);
        ahead.advance();
        assert_eq!(ahead.next_persistence_time, now + 2_500 + 5_000);
    }

    #[test]
    fn rotation_follows_the_ratio_of_intervals() {
        // With intervals 10 and 40 and one delta per turn, "a" runs four
        // times as often as "b".
        let mut slots = vec![slot("a", 10, 10_000), slot("b", 40, 40_000)];
        let mut counts = [0, 0];
        for _ in 0..50 {
            let now = slots.iter().map(|s| s.next_persistence_time).min().unwrap_or(0);
            let i = select_next(&mut slots, now).unwrap();
            counts[i] += 1;
            slots[i].advance();
        }
        assert_eq!(counts, [40, 10]);
    }
}
