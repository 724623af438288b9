use chrono::{NaiveDate, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_not_past(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    if date < today {
        return Err(EngineError::InvalidDate(date));
    }
    Ok(())
}

pub(crate) fn validate_day_of_week(day: u8) -> Result<(), EngineError> {
    if !(1..=7).contains(&day) {
        return Err(EngineError::InvalidDayOfWeek(day));
    }
    Ok(())
}

pub(crate) fn validate_interval(minutes: u32) -> Result<(), EngineError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&minutes) {
        return Err(EngineError::InvalidTimeInterval(minutes));
    }
    Ok(())
}

pub(crate) fn validate_duration(slots: u32) -> Result<(), EngineError> {
    if !(1..=MAX_DURATION_SLOTS).contains(&slots) {
        return Err(EngineError::InvalidDuration(slots));
    }
    Ok(())
}

/// Each window must have `start <= end`; two non-empty windows must not overlap.
pub(crate) fn validate_windows(hours: &WorkingHours) -> Result<(), EngineError> {
    let WorkingHours {
        morning, afternoon, ..
    } = hours;
    if morning.start > morning.end || afternoon.start > afternoon.end {
        return Err(EngineError::InvalidStartTime);
    }
    if !morning.is_empty() && !afternoon.is_empty() && afternoon.start < morning.end {
        return Err(EngineError::InvalidStartTime);
    }
    validate_interval(hours.interval_minutes)
}

pub(crate) fn validate_closed_slots(count: usize) -> Result<(), EngineError> {
    if count > MAX_CLOSED_SLOTS_PER_OVERRIDE {
        return Err(EngineError::LimitExceeded("too many closed slots on one date"));
    }
    Ok(())
}

pub(crate) fn validate_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// Commit-time check, run under the barber's write lock.
///
/// Whatever the availability read saw, a booking already holding any part of
/// `[start, end)` on `date` makes this commit lose.
pub(crate) fn check_no_overlap(
    bs: &BarberState,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
) -> Result<(), EngineError> {
    if bs.overlapping(date, start, end).next().is_some() {
        return Err(EngineError::TimeSlotNotAvailable);
    }
    if bs.bookings_on(date).len() >= MAX_BOOKINGS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many bookings on one date"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn hours(am: (NaiveTime, NaiveTime), pm: (NaiveTime, NaiveTime), interval: u32) -> WorkingHours {
        WorkingHours::new(Window::new(am.0, am.1), Window::new(pm.0, pm.1), interval)
    }

    #[test]
    fn past_dates_rejected() {
        let today = d(2030, 1, 7);
        assert_eq!(
            validate_not_past(d(2030, 1, 6), today),
            Err(EngineError::InvalidDate(d(2030, 1, 6)))
        );
        assert!(validate_not_past(today, today).is_ok());
        assert!(validate_not_past(d(2031, 1, 1), today).is_ok());
    }

    #[test]
    fn day_of_week_bounds() {
        assert_eq!(validate_day_of_week(0), Err(EngineError::InvalidDayOfWeek(0)));
        assert_eq!(validate_day_of_week(8), Err(EngineError::InvalidDayOfWeek(8)));
        assert!(validate_day_of_week(1).is_ok());
        assert!(validate_day_of_week(7).is_ok());
    }

    #[test]
    fn interval_bounds() {
        assert_eq!(validate_interval(15), Err(EngineError::InvalidTimeInterval(15)));
        assert_eq!(validate_interval(65), Err(EngineError::InvalidTimeInterval(65)));
        assert!(validate_interval(20).is_ok());
        assert!(validate_interval(60).is_ok());
    }

    #[test]
    fn duration_bounds() {
        assert_eq!(validate_duration(0), Err(EngineError::InvalidDuration(0)));
        assert!(validate_duration(1).is_ok());
        assert!(validate_duration(MAX_DURATION_SLOTS).is_ok());
        assert!(validate_duration(MAX_DURATION_SLOTS + 1).is_err());
    }

    #[test]
    fn reversed_window_rejected() {
        let h = hours((hm(12, 0), hm(9, 0)), (hm(13, 0), hm(17, 0)), 30);
        assert_eq!(validate_windows(&h), Err(EngineError::InvalidStartTime));
    }

    #[test]
    fn overlapping_windows_rejected() {
        let h = hours((hm(9, 0), hm(13, 30)), (hm(13, 0), hm(17, 0)), 30);
        assert_eq!(validate_windows(&h), Err(EngineError::InvalidStartTime));
        // Touching is fine.
        let h = hours((hm(9, 0), hm(13, 0)), (hm(13, 0), hm(17, 0)), 30);
        assert!(validate_windows(&h).is_ok());
    }

    #[test]
    fn empty_window_does_not_count_as_overlap() {
        let h = hours((hm(0, 0), hm(0, 0)), (hm(13, 0), hm(17, 0)), 30);
        assert!(validate_windows(&h).is_ok());
        let h = hours((hm(9, 0), hm(12, 0)), (hm(10, 0), hm(10, 0)), 30);
        assert!(validate_windows(&h).is_ok());
    }

    #[test]
    fn windows_check_interval_too() {
        let h = hours((hm(9, 0), hm(12, 0)), (hm(13, 0), hm(17, 0)), 15);
        assert_eq!(validate_windows(&h), Err(EngineError::InvalidTimeInterval(15)));
    }

    #[test]
    fn overlap_at_commit() {
        let mut bs = BarberState::new(Ulid::new());
        let date = d(2030, 1, 7);
        bs.insert_booking(Booking {
            id: Ulid::new(),
            barber_id: bs.id,
            user_id: Ulid::new(),
            service_id: Ulid::new(),
            date,
            start: hm(10, 0),
            end: hm(11, 0),
        });
        assert_eq!(
            check_no_overlap(&bs, date, hm(10, 30), hm(11, 30)),
            Err(EngineError::TimeSlotNotAvailable)
        );
        assert!(check_no_overlap(&bs, date, hm(11, 0), hm(11, 30)).is_ok());
        assert!(check_no_overlap(&bs, date, hm(9, 0), hm(10, 0)).is_ok());
        // Other dates are independent.
        assert!(check_no_overlap(&bs, d(2030, 1, 8), hm(10, 0), hm(11, 0)).is_ok());
    }
}
