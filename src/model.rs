use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open session `[start, end)` within a working day. `start == end` means no session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Window {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn closed() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// The AM/PM windows and slot interval in force for one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub morning: Window,
    pub afternoon: Window,
    pub interval_minutes: u32,
}

impl WorkingHours {
    pub fn new(morning: Window, afternoon: Window, interval_minutes: u32) -> Self {
        Self {
            morning,
            afternoon,
            interval_minutes,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes))
    }
}

/// Per-date replacement of the weekly template.
///
/// `hours: None` keeps the template's windows for the date while still applying
/// `closed_slots` and `fully_closed`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleOverride {
    pub hours: Option<WorkingHours>,
    pub closed_slots: BTreeSet<NaiveTime>,
    pub fully_closed: bool,
}

/// A confirmed appointment spanning `[start, end)` on `date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub barber_id: Ulid,
    pub user_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Booking {
    /// True if `t` falls inside `[start, end)`.
    pub fn covers(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }

    pub fn overlaps(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start < end && start < self.end
    }
}

/// A bookable service in a barber's catalog. Duration is counted in slots, not minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub barber_id: Ulid,
    pub name: String,
    pub duration_slots: u32,
    pub price_cents: u32,
    pub active: bool,
}

/// ISO weekday number, 1 = Monday .. 7 = Sunday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().number_from_monday() as u8
}

/// Schedule and booking state for one barber.
#[derive(Debug, Clone)]
pub struct BarberState {
    pub id: Ulid,
    /// Keyed by ISO weekday (1..=7).
    pub templates: BTreeMap<u8, WorkingHours>,
    pub overrides: BTreeMap<NaiveDate, ScheduleOverride>,
    /// Bookings per date, each list sorted by `start`.
    pub bookings: BTreeMap<NaiveDate, Vec<Booking>>,
}

impl BarberState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            templates: BTreeMap::new(),
            overrides: BTreeMap::new(),
            bookings: BTreeMap::new(),
        }
    }

    /// Insert booking maintaining sort order by start time.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.bookings.entry(booking.date).or_default();
        let pos = day
            .binary_search_by_key(&booking.start, |b| b.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, date: NaiveDate, id: Ulid) -> Option<Booking> {
        let day = self.bookings.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.bookings.remove(&date);
        }
        Some(removed)
    }

    pub fn bookings_on(&self, date: NaiveDate) -> &[Booking] {
        self.bookings.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True if any booking on `date` covers the slot starting at `t`.
    pub fn is_occupied(&self, date: NaiveDate, t: NaiveTime) -> bool {
        // Sorted by start, so everything from the first booking starting after `t` is irrelevant.
        let day = self.bookings_on(date);
        let right_bound = day.partition_point(|b| b.start <= t);
        day[..right_bound].iter().any(|b| b.covers(t))
    }

    /// Return bookings on `date` whose span overlaps `[start, end)`.
    pub fn overlapping(
        &self,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> impl Iterator<Item = &Booking> {
        let day = self.bookings_on(date);
        let right_bound = day.partition_point(|b| b.start < end);
        day[..right_bound].iter().filter(move |b| b.end > start)
    }
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BarberRegistered {
        id: Ulid,
        phone: String,
    },
    UserRegistered {
        id: Ulid,
        phone: String,
    },
    ServiceUpserted {
        service: ServiceInfo,
    },
    ServiceRemoved {
        id: Ulid,
    },
    TemplateConfigured {
        barber_id: Ulid,
        day_of_week: u8,
        hours: WorkingHours,
    },
    /// Whole-value replace; every override mutation is written this way.
    OverrideSet {
        barber_id: Ulid,
        date: NaiveDate,
        schedule: ScheduleOverride,
    },
    OverrideRemoved {
        barber_id: Ulid,
        date: NaiveDate,
    },
    BookingConfirmed {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        barber_id: Ulid,
        date: NaiveDate,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub barber_id: Ulid,
    pub day_of_week: u8,
    pub hours: WorkingHours,
}

/// The windows actually in force for a date after applying override precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveSchedule {
    Template(WorkingHours),
    Override {
        hours: WorkingHours,
        closed_slots: BTreeSet<NaiveTime>,
    },
    FullyClosed,
    Unconfigured,
}

impl EffectiveSchedule {
    pub fn hours(&self) -> Option<&WorkingHours> {
        match self {
            EffectiveSchedule::Template(hours) | EffectiveSchedule::Override { hours, .. } => {
                Some(hours)
            }
            EffectiveSchedule::FullyClosed | EffectiveSchedule::Unconfigured => None,
        }
    }

    pub fn is_closed_slot(&self, t: NaiveTime) -> bool {
        match self {
            EffectiveSchedule::Override { closed_slots, .. } => closed_slots.contains(&t),
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: NaiveTime, end: NaiveTime) -> Booking {
        Booking {
            id: Ulid::new(),
            barber_id: Ulid::nil(),
            user_id: Ulid::nil(),
            service_id: Ulid::nil(),
            date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            start,
            end,
        }
    }

    #[test]
    fn window_empty() {
        assert!(Window::closed().is_empty());
        assert!(Window::new(hm(9, 0), hm(9, 0)).is_empty());
        assert!(!Window::new(hm(9, 0), hm(12, 0)).is_empty());
    }

    #[test]
    fn booking_covers_half_open() {
        let b = booking(hm(10, 0), hm(11, 0));
        assert!(b.covers(hm(10, 0)));
        assert!(b.covers(hm(10, 30)));
        assert!(!b.covers(hm(11, 0))); // half-open
        assert!(!b.covers(hm(9, 30)));
    }

    #[test]
    fn booking_overlap() {
        let b = booking(hm(10, 0), hm(11, 0));
        assert!(b.overlaps(hm(10, 30), hm(11, 30)));
        assert!(!b.overlaps(hm(11, 0), hm(11, 30))); // adjacent, not overlapping
        assert!(!b.overlaps(hm(9, 0), hm(10, 0)));
    }

    #[test]
    fn weekday_numbering() {
        // 2030-01-07 is a Monday
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()), 1);
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2030, 1, 13).unwrap()), 7);
    }

    #[test]
    fn bookings_kept_sorted() {
        let mut bs = BarberState::new(Ulid::new());
        let late = booking(hm(15, 0), hm(15, 30));
        let early = booking(hm(9, 0), hm(9, 30));
        let mid = booking(hm(11, 0), hm(12, 0));
        let date = late.date;
        bs.insert_booking(late);
        bs.insert_booking(early);
        bs.insert_booking(mid);
        let starts: Vec<_> = bs.bookings_on(date).iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![hm(9, 0), hm(11, 0), hm(15, 0)]);
    }

    #[test]
    fn remove_booking_drops_empty_day() {
        let mut bs = BarberState::new(Ulid::new());
        let b = booking(hm(9, 0), hm(9, 30));
        let (id, date) = (b.id, b.date);
        bs.insert_booking(b);
        assert!(bs.remove_booking(date, id).is_some());
        assert!(bs.bookings.is_empty());
        assert!(bs.remove_booking(date, id).is_none());
    }

    #[test]
    fn occupancy_includes_interior_slots() {
        let mut bs = BarberState::new(Ulid::new());
        let b = booking(hm(10, 0), hm(11, 0));
        let date = b.date;
        bs.insert_booking(b);
        assert!(bs.is_occupied(date, hm(10, 0)));
        assert!(bs.is_occupied(date, hm(10, 30)));
        assert!(!bs.is_occupied(date, hm(11, 0)));
        assert!(!bs.is_occupied(date, hm(9, 30)));
    }

    #[test]
    fn overlapping_skips_adjacent() {
        let mut bs = BarberState::new(Ulid::new());
        let b = booking(hm(10, 0), hm(11, 0));
        let date = b.date;
        bs.insert_booking(b);
        assert_eq!(bs.overlapping(date, hm(10, 30), hm(11, 30)).count(), 1);
        assert_eq!(bs.overlapping(date, hm(11, 0), hm(12, 0)).count(), 0);
        assert_eq!(bs.overlapping(date, hm(9, 0), hm(10, 0)).count(), 0);
    }

    #[test]
    fn effective_schedule_closed_slots() {
        let hours = WorkingHours::new(Window::new(hm(9, 0), hm(12, 0)), Window::closed(), 30);
        let sched = EffectiveSchedule::Override {
            hours,
            closed_slots: [hm(9, 30)].into_iter().collect(),
        };
        assert!(sched.is_closed_slot(hm(9, 30)));
        assert!(!sched.is_closed_slot(hm(9, 0)));
        assert!(!EffectiveSchedule::Template(hours).is_closed_slot(hm(9, 30)));
        assert_eq!(EffectiveSchedule::FullyClosed.hours(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::OverrideSet {
            barber_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            schedule: ScheduleOverride {
                hours: None,
                closed_slots: [hm(10, 0)].into_iter().collect(),
                fully_closed: false,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
