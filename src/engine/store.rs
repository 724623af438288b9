use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Identity and service lookups the booking path depends on.
///
/// Implemented by [`Catalog`]; an embedding application can supply its own.
pub trait Directory: Send + Sync {
    fn user_exists(&self, user_id: &Ulid) -> bool;
    fn resolve_user_id(&self, phone: &str) -> Option<Ulid>;
    fn barber_exists(&self, barber_id: &Ulid) -> bool;
    fn resolve_barber_id(&self, phone: &str) -> Option<Ulid>;

    /// Duration in slots of an active service offered by `barber_id`.
    fn service_duration_slots(&self, barber_id: &Ulid, service_id: &Ulid) -> Option<u32>;

    fn service_exists(&self, barber_id: &Ulid, service_id: &Ulid) -> bool {
        self.service_duration_slots(barber_id, service_id).is_some()
    }
}

/// In-memory users, barbers and service catalog, rebuilt from the WAL.
pub struct Catalog {
    users: DashMap<Ulid, String>,
    user_phones: DashMap<String, Ulid>,
    barbers: DashMap<Ulid, String>,
    barber_phones: DashMap<String, Ulid>,
    services: DashMap<Ulid, ServiceInfo>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            user_phones: DashMap::new(),
            barbers: DashMap::new(),
            barber_phones: DashMap::new(),
            services: DashMap::new(),
        }
    }

    // ── People ───────────────────────────────────────────────

    pub fn barber_count(&self) -> usize {
        self.barbers.len()
    }

    pub fn user_phone(&self, id: &Ulid) -> Option<String> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn barber_phone(&self, id: &Ulid) -> Option<String> {
        self.barbers.get(id).map(|e| e.value().clone())
    }

    pub fn user_phone_taken(&self, phone: &str, except: &Ulid) -> bool {
        self.user_phones.get(phone).is_some_and(|e| e.value() != except)
    }

    pub fn barber_phone_taken(&self, phone: &str, except: &Ulid) -> bool {
        self.barber_phones.get(phone).is_some_and(|e| e.value() != except)
    }

    // ── Services ─────────────────────────────────────────────

    pub fn get_service(&self, id: &Ulid) -> Option<ServiceInfo> {
        self.services.get(id).map(|e| e.value().clone())
    }

    /// Active services for a barber, ordered by name.
    pub fn active_services(&self, barber_id: &Ulid) -> Vec<ServiceInfo> {
        let mut list: Vec<ServiceInfo> = self
            .services
            .iter()
            .filter(|e| e.barber_id == *barber_id && e.active)
            .map(|e| e.value().clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        list
    }

    // ── Snapshot (compaction) ────────────────────────────────

    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for e in self.barbers.iter() {
            events.push(Event::BarberRegistered {
                id: *e.key(),
                phone: e.value().clone(),
            });
        }
        for e in self.users.iter() {
            events.push(Event::UserRegistered {
                id: *e.key(),
                phone: e.value().clone(),
            });
        }
        for e in self.services.iter() {
            events.push(Event::ServiceUpserted {
                service: e.value().clone(),
            });
        }
        events
    }

    // ── Event application ────────────────────────────────────

    /// Apply a catalog event. Schedule and booking events are ignored here.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::BarberRegistered { id, phone } => {
                if let Some(old) = self.barbers.insert(*id, phone.clone()) {
                    self.barber_phones.remove(&old);
                }
                self.barber_phones.insert(phone.clone(), *id);
            }
            Event::UserRegistered { id, phone } => {
                if let Some(old) = self.users.insert(*id, phone.clone()) {
                    self.user_phones.remove(&old);
                }
                self.user_phones.insert(phone.clone(), *id);
            }
            Event::ServiceUpserted { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::ServiceRemoved { id } => {
                self.services.remove(id);
            }
            Event::TemplateConfigured { .. }
            | Event::OverrideSet { .. }
            | Event::OverrideRemoved { .. }
            | Event::BookingConfirmed { .. }
            | Event::BookingCancelled { .. } => {}
        }
    }
}

impl Directory for Catalog {
    fn user_exists(&self, user_id: &Ulid) -> bool {
        self.users.contains_key(user_id)
    }

    fn resolve_user_id(&self, phone: &str) -> Option<Ulid> {
        self.user_phones.get(phone).map(|e| *e.value())
    }

    fn barber_exists(&self, barber_id: &Ulid) -> bool {
        self.barbers.contains_key(barber_id)
    }

    fn resolve_barber_id(&self, phone: &str) -> Option<Ulid> {
        self.barber_phones.get(phone).map(|e| *e.value())
    }

    fn service_duration_slots(&self, barber_id: &Ulid, service_id: &Ulid) -> Option<u32> {
        self.services
            .get(service_id)
            .filter(|s| s.barber_id == *barber_id && s.active)
            .map(|s| s.duration_slots)
    }
}
