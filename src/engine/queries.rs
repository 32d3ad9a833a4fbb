use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, Entity};

fn newest_first(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| (b.date, b.time, b.id).cmp(&(a.date, a.time, a.id)));
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────

    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    /// Sorted by title.
    pub fn list_services(&self, active_only: bool) -> Vec<Service> {
        let mut out: Vec<Service> = self
            .services
            .iter()
            .filter(|e| !active_only || e.is_active)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get_master_info(&self, id: Ulid) -> Result<Master, EngineError> {
        let ms = self
            .get_master(&id)
            .ok_or(EngineError::NotFound(Entity::Master, id))?;
        Ok(ms.read().await.master.clone())
    }

    /// Best rated first, then by name. `service_id` keeps only masters linked to it.
    pub async fn list_masters(&self, active_only: bool, service_id: Option<Ulid>) -> Vec<Master> {
        let all: Vec<_> = self.masters.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ms in all {
            let guard = ms.read().await;
            if active_only && !guard.master.is_active {
                continue;
            }
            if service_id.is_some_and(|s| !guard.performs(&s)) {
                continue;
            }
            out.push(guard.master.clone());
        }
        out.sort_by(|a, b| {
            b.rating
                .total_cmp(&a.rating)
                .then_with(|| a.name.cmp(&b.name))
                .then(a.id.cmp(&b.id))
        });
        out
    }

    /// Active services the master performs, by title.
    pub async fn get_master_services(&self, master_id: Ulid) -> Result<Vec<Service>, EngineError> {
        let ms = self
            .get_master(&master_id)
            .ok_or(EngineError::NotFound(Entity::Master, master_id))?;
        let linked = ms.read().await.services.clone();
        let mut out: Vec<Service> = linked
            .iter()
            .filter_map(|id| self.get_service(id))
            .filter(|s| s.is_active)
            .collect();
        out.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// The stored week, sorted by day.
    pub async fn get_master_schedule(
        &self,
        master_id: Ulid,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        let ms = self
            .get_master(&master_id)
            .ok_or(EngineError::NotFound(Entity::Master, master_id))?;
        Ok(ms.read().await.schedule.clone())
    }

    // ── Bookings ─────────────────────────────────────────

    pub async fn get_booking_info(&self, id: Ulid) -> Option<Booking> {
        let b = self.get_booking(&id)?;
        Some(b.read().await.clone())
    }

    /// A booking with its history. Only its owner or an admin may read it.
    pub async fn booking_details(
        &self,
        id: Ulid,
        actor: &Actor,
    ) -> Result<BookingDetails, EngineError> {
        let booking = self
            .get_booking_info(id)
            .await
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        if !actor.is_admin() && booking.user_id != actor.id {
            return Err(EngineError::Forbidden("booking belongs to another user"));
        }
        Ok(BookingDetails {
            history: self.booking_history(id),
            booking,
        })
    }

    /// Status changes in the order they were applied. Survives hard deletion.
    pub fn booking_history(&self, id: Ulid) -> Vec<StatusChange> {
        self.history
            .get(&id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    async fn collect_bookings(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let all: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for b in all {
            let guard = b.read().await;
            if pred(&guard) {
                out.push(guard.clone());
            }
        }
        out
    }

    /// Newest appointment first.
    pub async fn user_bookings(&self, user_id: Ulid) -> Vec<Booking> {
        let mut out = self.collect_bookings(|b| b.user_id == user_id).await;
        newest_first(&mut out);
        out
    }

    pub async fn all_bookings(&self, status: Option<BookingStatus>) -> Vec<Booking> {
        let mut out = self
            .collect_bookings(|b| status.is_none_or(|s| b.status == s))
            .await;
        newest_first(&mut out);
        out
    }

    /// One day's bookings by start time.
    pub async fn bookings_on(&self, date: NaiveDate) -> Vec<Booking> {
        let mut out = self.collect_bookings(|b| b.date == date).await;
        out.sort_by_key(|b| (b.time, b.id));
        out
    }

    // ── Statistics ───────────────────────────────────────

    pub async fn user_booking_stats(&self, user_id: Ulid) -> BookingStats {
        let mut stats = BookingStats::default();
        for b in self.collect_bookings(|b| b.user_id == user_id).await {
            stats.total += 1;
            match b.status {
                BookingStatus::Pending => stats.pending += 1,
                BookingStatus::Confirmed => stats.confirmed += 1,
                BookingStatus::Rejected => stats.rejected += 1,
                BookingStatus::Completed => stats.completed += 1,
                BookingStatus::Cancelled => stats.cancelled += 1,
            }
            if b.status.is_live() {
                stats.active += 1;
            }
        }
        stats
    }

    /// Dashboard numbers. Revenue is the sum of completed bookings' service prices.
    pub async fn admin_stats(&self, today: NaiveDate) -> AdminStats {
        let mut stats = AdminStats::default();
        for b in self.collect_bookings(|_| true).await {
            if b.date == today {
                stats.today_bookings += 1;
            }
            match b.status {
                BookingStatus::Pending => stats.pending_bookings += 1,
                BookingStatus::Confirmed => stats.confirmed_bookings += 1,
                BookingStatus::Completed => {
                    stats.completed_bookings += 1;
                    let price = self.get_service(&b.service_id).map_or(0, |s| s.price);
                    stats.total_revenue = stats.total_revenue.saturating_add(price);
                }
                BookingStatus::Rejected | BookingStatus::Cancelled => {}
            }
        }
        stats
    }
}
