use std::collections::HashSet;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Entity, apply_to_master};

fn validate_service(service: &Service) -> Result<(), EngineError> {
    let title = service.title.trim();
    if title.is_empty() {
        return Err(EngineError::invalid("service title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("service title too long"));
    }
    if service
        .description
        .as_ref()
        .is_some_and(|d| d.len() > MAX_TEXT_LEN)
    {
        return Err(EngineError::LimitExceeded("service description too long"));
    }
    if service.duration_minutes == 0 {
        return Err(EngineError::invalid("service duration must be at least one minute"));
    }
    if service.duration_minutes > MAX_SLOT_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("service duration longer than a day"));
    }
    if service.price < 0 {
        return Err(EngineError::invalid("service price must not be negative"));
    }
    Ok(())
}

fn validate_master(master: &Master) -> Result<(), EngineError> {
    let name_len = master.name.trim().chars().count();
    if name_len < MIN_MASTER_NAME_LEN {
        return Err(EngineError::invalid(format!(
            "master name must be at least {MIN_MASTER_NAME_LEN} characters"
        )));
    }
    if name_len > MAX_MASTER_NAME_LEN {
        return Err(EngineError::LimitExceeded("master name too long"));
    }
    if master.bio.as_ref().is_some_and(|b| b.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("master bio too long"));
    }
    if master.experience_years > MAX_EXPERIENCE_YEARS {
        return Err(EngineError::invalid(format!(
            "experience must be between 0 and {MAX_EXPERIENCE_YEARS} years"
        )));
    }
    if !master.rating.is_finite() || !(0.0..=5.0).contains(&master.rating) {
        return Err(EngineError::invalid("rating must be between 0 and 5"));
    }
    Ok(())
}

/// A week is valid when every day is in 0..=6, appears at most once, and
/// enabled days open before they close.
pub(crate) fn validate_week(entries: &[ScheduleEntry]) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for e in entries {
        if e.day_of_week > 6 {
            return Err(EngineError::invalid(format!(
                "day_of_week must be 0..6, got {}",
                e.day_of_week
            )));
        }
        if !seen.insert(e.day_of_week) {
            return Err(EngineError::invalid(format!(
                "day_of_week {} listed twice",
                e.day_of_week
            )));
        }
        if e.is_available && e.start >= e.end {
            return Err(EngineError::invalid(format!(
                "day {}: start {} must be before end {}",
                e.day_of_week, e.start, e.end
            )));
        }
    }
    Ok(())
}

impl Engine {
    // ── Services ─────────────────────────────────────────

    pub async fn create_service(&self, service: Service) -> Result<Service, EngineError> {
        validate_service(&service)?;
        let _catalog = self.catalog.lock().await;
        self.store_service(service, true).await
    }

    pub async fn update_service(&self, service: Service) -> Result<Service, EngineError> {
        validate_service(&service)?;
        let _catalog = self.catalog.lock().await;
        self.store_service(service, false).await
    }

    /// Create the service, or replace it if the id exists. The flag is true on create.
    pub async fn save_service(&self, service: Service) -> Result<(Service, bool), EngineError> {
        validate_service(&service)?;
        let _catalog = self.catalog.lock().await;
        let create = !self.services.contains_key(&service.id);
        let service = self.store_service(service, create).await?;
        Ok((service, create))
    }

    /// Caller holds the catalog lock.
    async fn store_service(&self, service: Service, create: bool) -> Result<Service, EngineError> {
        let _gate = self.gate.read().await;
        let exists = self.services.contains_key(&service.id);
        if create {
            if exists {
                return Err(EngineError::AlreadyExists(Entity::Service, service.id));
            }
            if self.services.len() >= MAX_SERVICES {
                return Err(EngineError::LimitExceeded("too many services"));
            }
        } else if !exists {
            return Err(EngineError::NotFound(Entity::Service, service.id));
        }

        let event = Event::ServiceSaved { service: service.clone() };
        self.wal_append(&event).await?;
        self.apply_table_event(&event);
        if create {
            info!(service_id = %service.id, "service created: {}", service.title);
        }
        Ok(service)
    }

    /// Fails with `Referenced` while any booking points at the service.
    /// Links from masters are dropped with it.
    pub async fn delete_service(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        if !self.services.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Service, id));
        }
        let bookings = self.count_bookings(|b| b.service_id == id).await;
        if bookings > 0 {
            return Err(EngineError::Referenced {
                entity: Entity::Service,
                id,
                bookings,
            });
        }

        self.wal_append(&Event::ServiceDeleted { id }).await?;
        self.services.remove(&id);
        let masters: Vec<_> = self.masters.iter().map(|e| e.value().clone()).collect();
        for ms in masters {
            ms.write().await.unlink(&id);
        }
        info!(service_id = %id, "service deleted");
        Ok(())
    }

    // ── Masters ──────────────────────────────────────────

    pub async fn create_master(&self, master: Master) -> Result<Master, EngineError> {
        validate_master(&master)?;
        let _catalog = self.catalog.lock().await;
        self.store_master(master, true).await
    }

    /// Replace a master's profile. Schedule and service links are untouched.
    pub async fn update_master(&self, master: Master) -> Result<Master, EngineError> {
        validate_master(&master)?;
        let _catalog = self.catalog.lock().await;
        self.store_master(master, false).await
    }

    /// Create the master, or replace the profile if the id exists. A `None`
    /// rating keeps the stored one (0 for a new master). The flag is true on create.
    pub async fn save_master(
        &self,
        mut master: Master,
        rating: Option<f64>,
    ) -> Result<(Master, bool), EngineError> {
        let _catalog = self.catalog.lock().await;
        let stored = match self.get_master(&master.id) {
            Some(ms) => Some(ms.read().await.master.rating),
            None => None,
        };
        master.rating = rating.or(stored).unwrap_or(0.0);
        validate_master(&master)?;
        let create = stored.is_none();
        let master = self.store_master(master, create).await?;
        Ok((master, create))
    }

    /// Caller holds the catalog lock.
    async fn store_master(&self, master: Master, create: bool) -> Result<Master, EngineError> {
        let _gate = self.gate.read().await;
        let event = Event::MasterSaved { master: master.clone() };
        if create {
            if self.masters.contains_key(&master.id) {
                return Err(EngineError::AlreadyExists(Entity::Master, master.id));
            }
            if self.masters.len() >= MAX_MASTERS {
                return Err(EngineError::LimitExceeded("too many masters"));
            }
            self.wal_append(&event).await?;
            self.insert_master(master.clone());
            info!(master_id = %master.id, "master created: {}", master.name);
        } else {
            let ms = self
                .get_master(&master.id)
                .ok_or(EngineError::NotFound(Entity::Master, master.id))?;
            let mut guard = ms.write().await;
            self.wal_append(&event).await?;
            apply_to_master(&mut guard, &event);
        }
        Ok(master)
    }

    /// Removes the master with its schedule and service links. Fails with
    /// `Referenced` while any booking names the master.
    pub async fn delete_master(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        if !self.masters.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Master, id));
        }
        let bookings = self.count_bookings(|b| b.master_id == Some(id)).await;
        if bookings > 0 {
            return Err(EngineError::Referenced {
                entity: Entity::Master,
                id,
                bookings,
            });
        }

        let event = Event::MasterDeleted { id };
        self.wal_append(&event).await?;
        self.apply_table_event(&event);
        info!(master_id = %id, "master deleted");
        Ok(())
    }

    /// Returns `false` when the link already existed.
    pub async fn link_master_service(
        &self,
        master_id: Ulid,
        service_id: Ulid,
    ) -> Result<bool, EngineError> {
        let _gate = self.gate.read().await;
        if !self.services.contains_key(&service_id) {
            return Err(EngineError::NotFound(Entity::Service, service_id));
        }
        let ms = self
            .get_master(&master_id)
            .ok_or(EngineError::NotFound(Entity::Master, master_id))?;
        let mut guard = ms.write().await;
        if guard.performs(&service_id) {
            return Ok(false);
        }

        let event = Event::MasterServiceLinked { master_id, service_id };
        self.wal_append(&event).await?;
        apply_to_master(&mut guard, &event);
        Ok(true)
    }

    /// Returns `false` when there was no link.
    pub async fn unlink_master_service(
        &self,
        master_id: Ulid,
        service_id: Ulid,
    ) -> Result<bool, EngineError> {
        let _gate = self.gate.read().await;
        let ms = self
            .get_master(&master_id)
            .ok_or(EngineError::NotFound(Entity::Master, master_id))?;
        let mut guard = ms.write().await;
        if !guard.performs(&service_id) {
            return Ok(false);
        }

        let event = Event::MasterServiceUnlinked { master_id, service_id };
        self.wal_append(&event).await?;
        apply_to_master(&mut guard, &event);
        Ok(true)
    }

    // ── Schedules ────────────────────────────────────────

    /// Replace the whole week in one step and return it sorted by day.
    /// An empty list clears the schedule.
    pub async fn replace_master_schedule(
        &self,
        master_id: Ulid,
        entries: Vec<ScheduleEntry>,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        validate_week(&entries)?;
        let _gate = self.gate.read().await;
        let ms = self
            .get_master(&master_id)
            .ok_or(EngineError::NotFound(Entity::Master, master_id))?;
        let mut guard = ms.write().await;

        let event = Event::ScheduleReplaced { master_id, entries };
        self.wal_append(&event).await?;
        apply_to_master(&mut guard, &event);
        info!(
            master_id = %master_id,
            days = guard.schedule.len(),
            "schedule replaced"
        );
        Ok(guard.schedule.clone())
    }

    async fn count_bookings(&self, pred: impl Fn(&Booking) -> bool) -> usize {
        let all: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut n = 0;
        for b in all {
            if pred(&*b.read().await) {
                n += 1;
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(day: u8, start: &str, end: &str, is_available: bool) -> ScheduleEntry {
        ScheduleEntry {
            day_of_week: day,
            start: TimeOfDay::parse(start).unwrap(),
            end: TimeOfDay::parse(end).unwrap(),
            is_available,
        }
    }

    #[test]
    fn week_validation() {
        assert!(validate_week(&[]).is_ok());
        assert!(validate_week(&[entry(0, "10:00", "14:00", true), entry(6, "10:00", "14:00", true)]).is_ok());
        assert!(validate_week(&[entry(7, "10:00", "14:00", true)]).is_err());
        assert!(validate_week(&[entry(1, "10:00", "14:00", true), entry(1, "15:00", "18:00", true)]).is_err());
        assert!(validate_week(&[entry(2, "14:00", "10:00", true)]).is_err());
        assert!(validate_week(&[entry(2, "10:00", "10:00", true)]).is_err());
        // A disabled day may carry any times.
        assert!(validate_week(&[entry(3, "00:00", "00:00", false)]).is_ok());
    }

    #[test]
    fn master_validation() {
        let mut m = Master {
            id: Ulid::new(),
            name: "Anna".into(),
            bio: None,
            experience_years: 5,
            rating: 4.5,
            is_active: true,
        };
        assert!(validate_master(&m).is_ok());
        m.name = "A".into();
        assert!(matches!(validate_master(&m), Err(EngineError::InvalidInput(_))));
        m.name = "Anna".into();
        m.experience_years = 51;
        assert!(validate_master(&m).is_err());
        m.experience_years = 50;
        m.rating = f64::NAN;
        assert!(validate_master(&m).is_err());
    }

    #[test]
    fn service_validation() {
        let mut s = Service {
            id: Ulid::new(),
            title: "Haircut".into(),
            description: None,
            price: 0,
            duration_minutes: 30,
            is_active: true,
            category_id: None,
        };
        assert!(validate_service(&s).is_ok());
        s.duration_minutes = 0;
        assert!(validate_service(&s).is_err());
        s.duration_minutes = 30;
        s.price = -1;
        assert!(validate_service(&s).is_err());
        s.price = 100;
        s.title = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(matches!(validate_service(&s), Err(EngineError::LimitExceeded(_))));
    }
}
