use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_CANCELLED_TOTAL, BOOKINGS_CONFIRMED_TOTAL, BOOKING_CONFLICTS_TOTAL};

use super::availability::{resolve_schedule, service_end, start_times};
use super::conflict::*;
use super::{Engine, EngineError, SharedBarberState, WalCommand};

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn register_user(&self, id: Ulid, phone: String) -> Result<(), EngineError> {
        validate_text(&phone, MAX_PHONE_LEN, "phone number too long")?;
        let _gate = self.compaction_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.catalog.user_phone_taken(&phone, &id) {
            return Err(EngineError::PhoneInUse(phone));
        }
        self.persist_catalog(&Event::UserRegistered { id, phone }).await?;
        debug!("registered user {id}");
        Ok(())
    }

    pub async fn register_barber(&self, id: Ulid, phone: String) -> Result<(), EngineError> {
        validate_text(&phone, MAX_PHONE_LEN, "phone number too long")?;
        let _gate = self.compaction_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.catalog.barber_phone_taken(&phone, &id) {
            return Err(EngineError::PhoneInUse(phone));
        }
        if self.catalog.barber_phone(&id).is_none() && self.catalog.barber_count() >= MAX_BARBERS {
            return Err(EngineError::LimitExceeded("too many barbers"));
        }
        self.persist_catalog(&Event::BarberRegistered { id, phone }).await?;
        debug!("registered barber {id}");
        Ok(())
    }

    /// Create or replace a service in a barber's catalog. An id already used by
    /// another barber's service is rejected.
    pub async fn upsert_service(&self, service: ServiceInfo) -> Result<(), EngineError> {
        validate_duration(service.duration_slots)?;
        validate_text(&service.name, MAX_NAME_LEN, "service name too long")?;
        if !self.directory.barber_exists(&service.barber_id) {
            return Err(EngineError::BarberNotFound(service.barber_id));
        }
        let _gate = self.compaction_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let id = service.id;
        if self
            .catalog
            .get_service(&id)
            .is_some_and(|existing| existing.barber_id != service.barber_id)
        {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_catalog(&Event::ServiceUpserted { service }).await?;
        debug!("upserted service {id}");
        Ok(())
    }

    pub async fn set_service_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let mut service = self
            .catalog
            .get_service(&id)
            .ok_or(EngineError::ServiceNotFound(id))?;
        if service.active == active {
            return Ok(());
        }
        service.active = active;
        self.persist_catalog(&Event::ServiceUpserted { service }).await
    }

    /// Delete a service from the catalog. Bookings already made for it stay.
    pub async fn remove_service(&self, id: Ulid) -> Result<ServiceInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let service = self
            .catalog
            .get_service(&id)
            .ok_or(EngineError::ServiceNotFound(id))?;
        self.persist_catalog(&Event::ServiceRemoved { id }).await?;
        debug!("removed service {id}");
        Ok(service)
    }

    // ── Schedule configuration ───────────────────────────────

    pub async fn configure_template(
        &self,
        barber_id: Ulid,
        day_of_week: u8,
        hours: WorkingHours,
    ) -> Result<(), EngineError> {
        validate_day_of_week(day_of_week)?;
        validate_windows(&hours)?;
        let _gate = self.compaction_gate.read().await;
        let rs = self.barber_for_write(&barber_id)?;
        let mut guard = rs.write().await;
        let event = Event::TemplateConfigured {
            barber_id,
            day_of_week,
            hours,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("barber {barber_id}: template for weekday {day_of_week} configured");
        Ok(())
    }

    /// Create or replace the override for `date`.
    pub async fn set_override(
        &self,
        barber_id: Ulid,
        date: NaiveDate,
        hours: Option<WorkingHours>,
        closed_slots: BTreeSet<NaiveTime>,
        fully_closed: bool,
    ) -> Result<(), EngineError> {
        validate_not_past(date, self.today())?;
        if let Some(h) = &hours {
            validate_windows(h)?;
        }
        validate_closed_slots(closed_slots.len())?;
        let schedule = ScheduleOverride {
            hours,
            closed_slots,
            fully_closed,
        };
        let _gate = self.compaction_gate.read().await;
        let rs = self.barber_for_write(&barber_id)?;
        let mut guard = rs.write().await;
        self.write_override(&mut guard, date, schedule).await
    }

    /// Drop the override for `date`. A date without one is left as is.
    pub async fn remove_override(&self, barber_id: Ulid, date: NaiveDate) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let rs = self.barber_for_write(&barber_id)?;
        let mut guard = rs.write().await;
        if !guard.overrides.contains_key(&date) {
            return Ok(());
        }
        let event = Event::OverrideRemoved { barber_id, date };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("barber {barber_id}: override on {date} removed");
        Ok(())
    }

    pub async fn add_closed_slots(
        &self,
        barber_id: Ulid,
        date: NaiveDate,
        slots: &[NaiveTime],
    ) -> Result<(), EngineError> {
        self.edit_override(barber_id, date, |ov| {
            ov.closed_slots.extend(slots.iter().copied());
            validate_closed_slots(ov.closed_slots.len())
        })
        .await
    }

    pub async fn remove_closed_slots(
        &self,
        barber_id: Ulid,
        date: NaiveDate,
        slots: &[NaiveTime],
    ) -> Result<(), EngineError> {
        self.edit_override(barber_id, date, |ov| {
            for slot in slots {
                ov.closed_slots.remove(slot);
            }
            Ok(())
        })
        .await
    }

    pub async fn clear_closed_slots(&self, barber_id: Ulid, date: NaiveDate) -> Result<(), EngineError> {
        self.edit_override(barber_id, date, |ov| {
            ov.closed_slots.clear();
            Ok(())
        })
        .await
    }

    /// Open or close a whole date. Without an override, one is created that
    /// keeps the template's windows.
    pub async fn set_date_open(
        &self,
        barber_id: Ulid,
        date: NaiveDate,
        open: bool,
    ) -> Result<(), EngineError> {
        validate_not_past(date, self.today())?;
        let _gate = self.compaction_gate.read().await;
        let rs = self.barber_for_write(&barber_id)?;
        let mut guard = rs.write().await;
        let mut schedule = guard.overrides.get(&date).cloned().unwrap_or_default();
        schedule.fully_closed = !open;
        self.write_override(&mut guard, date, schedule).await
    }

    /// Read-modify-write of an existing override's closed slots.
    async fn edit_override(
        &self,
        barber_id: Ulid,
        date: NaiveDate,
        edit: impl FnOnce(&mut ScheduleOverride) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        validate_not_past(date, self.today())?;
        let _gate = self.compaction_gate.read().await;
        let rs = self.barber_for_write(&barber_id)?;
        let mut guard = rs.write().await;
        let mut schedule = guard
            .overrides
            .get(&date)
            .cloned()
            .ok_or(EngineError::TimeSlotNotFound(date))?;
        edit(&mut schedule)?;
        self.write_override(&mut guard, date, schedule).await
    }

    async fn write_override(
        &self,
        bs: &mut BarberState,
        date: NaiveDate,
        schedule: ScheduleOverride,
    ) -> Result<(), EngineError> {
        let barber_id = bs.id;
        let event = Event::OverrideSet {
            barber_id,
            date,
            schedule,
        };
        self.persist_and_apply(bs, &event).await?;
        debug!("barber {barber_id}: override on {date} set");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Book `service_id` with `barber_id` at `start` on `date`.
    ///
    /// Checks run in order and stop at the first failure: the user, then the
    /// service, then membership of `start` in the available start times. The
    /// overlap check is repeated under the write lock at commit.
    pub async fn book_appointment(
        &self,
        id: Ulid,
        barber_id: Ulid,
        user_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
    ) -> Result<Booking, EngineError> {
        if !self.directory.user_exists(&user_id) {
            return Err(EngineError::UserNotFound(user_id));
        }
        let duration = self
            .directory
            .service_duration_slots(&barber_id, &service_id)
            .ok_or(EngineError::ServiceNotFound(service_id))?;
        validate_not_past(date, self.today())?;

        let _gate = self.compaction_gate.read().await;
        let rs = self
            .get_barber(&barber_id)
            .ok_or(EngineError::TimeSlotNotAvailable)?;
        let end = {
            let guard = rs.read().await;
            let schedule = resolve_schedule(&guard, date);
            let hours = schedule.hours().ok_or(EngineError::TimeSlotNotAvailable)?;
            if !start_times(&guard, date, &schedule, duration).contains(&start) {
                return Err(EngineError::TimeSlotNotAvailable);
            }
            service_end(hours, start, duration).ok_or(EngineError::TimeSlotNotAvailable)?
        };

        let booking = Booking {
            id,
            barber_id,
            user_id,
            service_id,
            date,
            start,
            end,
        };
        self.commit_booking(&rs, booking).await
    }

    /// Serialized check-then-insert. The loser of a race for the same time
    /// fails here with `TimeSlotNotAvailable`.
    pub(super) async fn commit_booking(
        &self,
        rs: &SharedBarberState,
        booking: Booking,
    ) -> Result<Booking, EngineError> {
        let mut guard = rs.write().await;
        if let Err(e) = check_no_overlap(&guard, booking.date, booking.start, booking.end) {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }
        // Ids are global; the barber lock alone does not cover other barbers.
        if !self
            .bookings
            .reserve(booking.id, booking.barber_id, booking.date)
        {
            return Err(EngineError::AlreadyExists(booking.id));
        }
        let event = Event::BookingConfirmed {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.bookings.release(&booking.id);
            return Err(e);
        }
        metrics::counter!(BOOKINGS_CONFIRMED_TOTAL).increment(1);
        info!(
            "booking {} confirmed: barber {} on {} {}-{}",
            booking.id,
            booking.barber_id,
            booking.date,
            booking.start.format("%H:%M"),
            booking.end.format("%H:%M")
        );
        Ok(booking)
    }

    /// Remove a booking. Returns the cancelled booking.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let (barber_id, date) = self
            .bookings
            .locate(&id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let rs = self
            .get_barber(&barber_id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let mut guard = rs.write().await;
        // A concurrent cancel may have won while we waited for the lock.
        let booking = guard
            .bookings_on(date)
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(id))?;
        let event = Event::BookingCancelled { id, barber_id, date };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {id} cancelled");
        Ok(booking)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction_gate.write().await;

        let mut events = self.catalog.snapshot_events();
        let barbers: Vec<SharedBarberState> = self.state.iter().map(|e| e.value().clone()).collect();
        for rs in barbers {
            let guard = rs.read().await;
            let barber_id = guard.id;
            for (&day_of_week, &hours) in &guard.templates {
                events.push(Event::TemplateConfigured {
                    barber_id,
                    day_of_week,
                    hours,
                });
            }
            for (&date, schedule) in &guard.overrides {
                events.push(Event::OverrideSet {
                    barber_id,
                    date,
                    schedule: schedule.clone(),
                });
            }
            for booking in guard.bookings.values().flatten() {
                events.push(Event::BookingConfirmed {
                    booking: booking.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
