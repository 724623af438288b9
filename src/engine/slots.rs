use chrono::{Duration, NaiveTime};

use crate::model::{Window, WorkingHours};

// ── Slot Generator ────────────────────────────────────────────────

/// Start times within one window: `start`, `start + step`, ... while `< end`.
///
/// Holds no shared state: a clone taken before iterating yields the same sequence again.
#[derive(Debug, Clone)]
pub struct WindowSlots {
    next: Option<NaiveTime>,
    end: NaiveTime,
    step: Duration,
}

impl WindowSlots {
    pub fn new(window: Window, step: Duration) -> Self {
        let next = (!window.is_empty() && step > Duration::zero()).then_some(window.start);
        Self {
            next,
            end: window.end,
            step,
        }
    }
}

impl Iterator for WindowSlots {
    type Item = NaiveTime;

    fn next(&mut self) -> Option<NaiveTime> {
        let current = self.next.filter(|t| *t < self.end)?;
        self.next = add_within_day(current, self.step);
        Some(current)
    }
}

/// `t + d`, or `None` if that passes midnight.
///
/// `NaiveTime` has no 24:00, so a sum landing exactly on midnight is `None`
/// too: a slot whose service would end at 24:00 is never offered.
pub fn add_within_day(t: NaiveTime, d: Duration) -> Option<NaiveTime> {
    let (sum, wrapped_secs) = t.overflowing_add_signed(d);
    (wrapped_secs == 0).then_some(sum)
}

/// Morning run followed by afternoon run.
pub fn generate_slots(hours: &WorkingHours) -> std::iter::Chain<WindowSlots, WindowSlots> {
    let (morning, afternoon) = slot_runs(hours);
    morning.chain(afternoon)
}

/// The two runs separately; multi-slot services never cross from one into the other.
pub fn slot_runs(hours: &WorkingHours) -> (WindowSlots, WindowSlots) {
    let step = hours.interval();
    (
        WindowSlots::new(hours.morning, step),
        WindowSlots::new(hours.afternoon, step),
    )
}
