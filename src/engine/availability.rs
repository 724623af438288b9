use chrono::{NaiveDate, NaiveTime};

use crate::model::*;

use super::slots::{add_within_day, slot_runs};

// ── Availability Algorithm ────────────────────────────────────────

/// Resolve the windows in force for `date`.
///
/// An override always wins over the template. An override that carries no hours
/// of its own borrows the template's windows but keeps its own closed slots.
pub fn resolve_schedule(barber: &BarberState, date: NaiveDate) -> EffectiveSchedule {
    let template = barber.templates.get(&day_of_week(date)).copied();
    match barber.overrides.get(&date) {
        Some(ov) if ov.fully_closed => EffectiveSchedule::FullyClosed,
        Some(ov) => match ov.hours.or(template) {
            Some(hours) => EffectiveSchedule::Override {
                hours,
                closed_slots: ov.closed_slots.clone(),
            },
            None => EffectiveSchedule::Unconfigured,
        },
        None => match template {
            Some(hours) => EffectiveSchedule::Template(hours),
            None => EffectiveSchedule::Unconfigured,
        },
    }
}

/// A slot is free if it is not closed and no booking on the date covers it.
fn is_free(barber: &BarberState, date: NaiveDate, schedule: &EffectiveSchedule, t: NaiveTime) -> bool {
    !schedule.is_closed_slot(t) && !barber.is_occupied(date, t)
}

/// Start times for a service lasting `duration_slots` intervals.
///
/// Each candidate is checked sub-slot by sub-slot, so a single booked or closed
/// slot in the middle of a run only blocks the candidates whose run contains it.
/// Candidates never straddle the morning/afternoon gap and never end past midnight.
pub fn start_times(
    barber: &BarberState,
    date: NaiveDate,
    schedule: &EffectiveSchedule,
    duration_slots: u32,
) -> Vec<NaiveTime> {
    let Some(hours) = schedule.hours() else {
        return Vec::new();
    };
    let duration = duration_slots.max(1) as usize;
    let (morning, afternoon) = slot_runs(hours);
    let service_len = hours.interval() * duration_slots.max(1) as i32;

    let mut result = Vec::new();
    for run in [morning.collect::<Vec<_>>(), afternoon.collect::<Vec<_>>()] {
        if run.len() < duration {
            continue;
        }
        for i in 0..=(run.len() - duration) {
            let start = run[i];
            if add_within_day(start, service_len).is_none() {
                continue;
            }
            if run[i..i + duration]
                .iter()
                .all(|&t| is_free(barber, date, schedule, t))
            {
                result.push(start);
            }
        }
    }
    result
}

/// Single-slot availability: every free slot of the effective schedule.
pub fn single_slot_times(
    barber: &BarberState,
    date: NaiveDate,
    schedule: &EffectiveSchedule,
) -> Vec<NaiveTime> {
    start_times(barber, date, schedule, 1)
}

/// End of a service starting at `start`, or `None` if it would run past midnight.
pub fn service_end(hours: &WorkingHours, start: NaiveTime, duration_slots: u32) -> Option<NaiveTime> {
    add_within_day(start, hours.interval() * duration_slots as i32)
}
