use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::evaluate_window;
use super::ledger::{now_ms, today, validate_booking_date};
use super::{Engine, EngineError, Entity};

const SELF_CANCEL_COMMENT: &str = "cancelled by user";

/// Everything needed to place a booking. The caller picks the id.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub user_id: Ulid,
    pub service_id: Ulid,
    pub master_id: Option<Ulid>,
    pub date: NaiveDate,
    pub time: TimeOfDay,
}

/// Outcome of [`Engine::delete_booking`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Row removed by an admin. History is kept.
    Deleted,
    /// A customer's own booking, cancelled instead of removed.
    Cancelled(Booking),
}

fn validate_comment(comment: Option<&str>) -> Result<(), EngineError> {
    if comment.is_some_and(|c| c.len() > MAX_COMMENT_LEN) {
        return Err(EngineError::LimitExceeded("comment too long"));
    }
    Ok(())
}

/// Claim on a booking id for the duration of one create. Released on drop.
struct IdReservation<'a> {
    engine: &'a Engine,
    id: Ulid,
}

impl<'a> IdReservation<'a> {
    fn take(engine: &'a Engine, id: Ulid) -> Result<Self, EngineError> {
        match engine.reserved_ids.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(Entity::Booking, id)),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Self { engine, id })
            }
        }
    }
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        self.engine.reserved_ids.remove(&self.id);
    }
}

fn slot_conflict(holder: Ulid) -> EngineError {
    metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
    EngineError::SlotTaken(holder)
}

impl Engine {
    /// Place a `pending` booking.
    ///
    /// Checks run in a fixed order and the first failure is returned: date,
    /// service, master availability, master/service link, then the slot claim.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        validate_booking_date(req.date, today())?;

        let _gate = self.gate.read().await;
        if self.bookings.len() >= MAX_BOOKINGS {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        // Held until the row is in `bookings`, so a racing create with the same
        // id sees either the reservation or the row.
        let _reservation = IdReservation::take(self, req.id)?;
        if self.bookings.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(Entity::Booking, req.id));
        }

        let service = self
            .get_service(&req.service_id)
            .ok_or(EngineError::NotFound(Entity::Service, req.service_id))?;
        if !service.is_active {
            return Err(EngineError::invalid(format!(
                "service {} is not active",
                service.id
            )));
        }

        // Held until the booking is in place so the week can't change under the check.
        let master_guard = match req.master_id {
            Some(master_id) => {
                let ms = self
                    .get_master(&master_id)
                    .ok_or(EngineError::NotFound(Entity::Master, master_id))?;
                let guard = ms.read_owned().await;
                if !guard.master.is_active {
                    return Err(EngineError::Unavailable(UnavailableReason::MasterInactive));
                }
                let key = LedgerKey {
                    scope: Scope::Master(master_id),
                    date: req.date,
                };
                let holder = self.slot_holder(&key, req.time);
                let window = guard.entry_for(day_of_week(req.date));
                if let Availability::Unavailable(reason) =
                    evaluate_window(window, req.time, holder.is_some())
                {
                    debug!(master_id = %master_id, date = %req.date, time = %req.time, "booking rejected: {reason}");
                    return Err(match (reason, holder) {
                        (UnavailableReason::AlreadyBooked, Some(holder)) => slot_conflict(holder),
                        _ => EngineError::Unavailable(reason),
                    });
                }
                if !guard.performs(&req.service_id) {
                    return Err(EngineError::invalid(format!(
                        "master {master_id} does not perform service {}",
                        req.service_id
                    )));
                }
                Some(guard)
            }
            None => None,
        };

        let now = now_ms();
        let booking = Booking {
            id: req.id,
            user_id: req.user_id,
            service_id: req.service_id,
            master_id: req.master_id,
            date: req.date,
            time: req.time,
            status: BookingStatus::Pending,
            admin_comment: None,
            created_at: now,
            updated_at: now,
        };

        let key = booking.ledger_key();
        self.claim_slot(key, booking.time, booking.id)
            .map_err(|e| match e {
                EngineError::SlotTaken(holder) => slot_conflict(holder),
                other => other,
            })?;

        if let Err(e) = self
            .wal_append(&Event::BookingCreated {
                booking: booking.clone(),
            })
            .await
        {
            self.release_slot(&key, booking.time, booking.id);
            return Err(e);
        }
        self.bookings
            .insert(booking.id, Arc::new(RwLock::new(booking.clone())));
        drop(master_guard);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            booking_id = %booking.id,
            user_id = %booking.user_id,
            "booking created for {} {}",
            booking.date,
            booking.time
        );
        Ok(booking)
    }

    /// Move a booking along the status table.
    ///
    /// Admins may make any legal move. Customers may only cancel their own bookings.
    pub async fn transition_status(
        &self,
        id: Ulid,
        to: BookingStatus,
        comment: Option<String>,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        validate_comment(comment.as_deref())?;
        let _gate = self.gate.read().await;
        let b = self
            .get_booking(&id)
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        let mut guard = b.write().await;
        if !self.is_current_booking(&id, &b) {
            return Err(EngineError::NotFound(Entity::Booking, id));
        }

        if !actor.is_admin() {
            if guard.user_id != actor.id {
                return Err(EngineError::Forbidden("booking belongs to another user"));
            }
            if to != BookingStatus::Cancelled {
                return Err(EngineError::Forbidden("customers may only cancel bookings"));
            }
        }

        self.change_status(&mut guard, to, comment, actor).await?;
        Ok(guard.clone())
    }

    /// Admins remove the row outright. Customers cancel their own live booking,
    /// which keeps the row.
    pub async fn delete_booking(&self, id: Ulid, actor: &Actor) -> Result<Removal, EngineError> {
        let _gate = self.gate.read().await;
        let b = self
            .get_booking(&id)
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        let mut guard = b.write().await;
        if !self.is_current_booking(&id, &b) {
            return Err(EngineError::NotFound(Entity::Booking, id));
        }

        if actor.is_admin() {
            self.wal_append(&Event::BookingDeleted { id }).await?;
            self.bookings.remove(&id);
            self.release_slot(&guard.ledger_key(), guard.time, id);
            info!(booking_id = %id, actor_id = %actor.id, "booking deleted");
            return Ok(Removal::Deleted);
        }

        if guard.user_id != actor.id {
            return Err(EngineError::Forbidden("booking belongs to another user"));
        }
        if !guard.status.is_live() {
            return Err(EngineError::invalid(format!(
                "only pending or confirmed bookings can be cancelled, this one is {}",
                guard.status
            )));
        }
        self.change_status(&mut guard, BookingStatus::Cancelled, Some(SELF_CANCEL_COMMENT.into()), actor)
            .await?;
        Ok(Removal::Cancelled(guard.clone()))
    }

    /// Persist and apply one legal status change to a write-locked booking.
    async fn change_status(
        &self,
        booking: &mut Booking,
        to: BookingStatus,
        comment: Option<String>,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let from = booking.status;
        if !from.can_transition_to(to) {
            debug!(booking_id = %booking.id, "illegal transition {from} -> {to}");
            return Err(EngineError::IllegalTransition { from, to });
        }

        let change = StatusChange {
            booking_id: booking.id,
            from,
            to,
            actor_id: actor.id,
            comment,
            at: now_ms(),
        };
        self.wal_append(&Event::StatusChanged {
            change: change.clone(),
        })
        .await?;
        self.apply_status_change(booking, &change);

        metrics::counter!(observability::STATUS_TRANSITIONS_TOTAL, "status" => to.as_str())
            .increment(1);
        info!(booking_id = %booking.id, actor_id = %actor.id, "booking {from} -> {to}");
        Ok(())
    }
}
