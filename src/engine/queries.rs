use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::availability::{resolve_schedule, single_slot_times, start_times};
use super::conflict::validate_not_past;
use super::{Engine, EngineError};

impl Engine {
    /// Free single-slot start times for `barber_id` on `date`, earliest first.
    /// An unconfigured or fully closed date yields an empty list.
    pub async fn available_single_slot_times(
        &self,
        barber_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<NaiveTime>, EngineError> {
        validate_not_past(date, self.today())?;
        let Some(rs) = self.get_barber(&barber_id) else {
            return Ok(vec![]);
        };
        let guard = rs.read().await;
        let schedule = resolve_schedule(&guard, date);
        Ok(single_slot_times(&guard, date, &schedule))
    }

    /// Start times whose whole run is free for `service_id`'s duration.
    /// Without a service this is the single-slot list.
    pub async fn available_start_times(
        &self,
        barber_id: Ulid,
        date: NaiveDate,
        service_id: Option<Ulid>,
    ) -> Result<Vec<NaiveTime>, EngineError> {
        let Some(service_id) = service_id else {
            return self.available_single_slot_times(barber_id, date).await;
        };
        validate_not_past(date, self.today())?;
        let duration = self
            .directory
            .service_duration_slots(&barber_id, &service_id)
            .ok_or(EngineError::ServiceNotFound(service_id))?;
        let Some(rs) = self.get_barber(&barber_id) else {
            return Ok(vec![]);
        };
        let guard = rs.read().await;
        let schedule = resolve_schedule(&guard, date);
        Ok(start_times(&guard, date, &schedule, duration))
    }

    pub async fn effective_schedule(&self, barber_id: Ulid, date: NaiveDate) -> EffectiveSchedule {
        match self.get_barber(&barber_id) {
            Some(rs) => resolve_schedule(&*rs.read().await, date),
            None => EffectiveSchedule::Unconfigured,
        }
    }

    /// Bookings for one barber on one date, ordered by start.
    pub async fn list_bookings(&self, barber_id: Ulid, date: NaiveDate) -> Vec<Booking> {
        let Some(rs) = self.get_barber(&barber_id) else {
            return vec![];
        };
        let guard = rs.read().await;
        guard.bookings_on(date).to_vec()
    }

    /// A user's bookings across all barbers, ordered by date then start.
    pub async fn list_bookings_for_user(&self, user_id: Ulid) -> Vec<Booking> {
        let mut result = Vec::new();
        for id in self.bookings.for_user(&user_id) {
            if let Some(b) = self.get_booking(id).await {
                result.push(b);
            }
        }
        result.sort_by_key(|b| (b.date, b.start));
        result
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let (barber_id, date) = self.bookings.locate(&id)?;
        let rs = self.get_barber(&barber_id)?;
        let guard = rs.read().await;
        guard.bookings_on(date).iter().find(|b| b.id == id).cloned()
    }

    /// Configured weekly templates, Monday first.
    pub async fn get_templates(&self, barber_id: Ulid) -> Vec<TemplateInfo> {
        let Some(rs) = self.get_barber(&barber_id) else {
            return vec![];
        };
        let guard = rs.read().await;
        guard
            .templates
            .iter()
            .map(|(&day_of_week, &hours)| TemplateInfo {
                barber_id,
                day_of_week,
                hours,
            })
            .collect()
    }

    pub async fn get_override(&self, barber_id: Ulid, date: NaiveDate) -> Option<ScheduleOverride> {
        let rs = self.get_barber(&barber_id)?;
        let guard = rs.read().await;
        guard.overrides.get(&date).cloned()
    }

    pub fn active_services(&self, barber_id: Ulid) -> Vec<ServiceInfo> {
        self.catalog.active_services(&barber_id)
    }

    /// The user registered under `phone`, if any.
    pub fn find_user_by_phone(&self, phone: &str) -> Option<Ulid> {
        self.directory.resolve_user_id(phone)
    }
}
