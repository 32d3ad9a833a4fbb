use std::collections::BTreeSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_SLOT_DURATION_MINUTES;
use crate::model::*;

use super::{Engine, EngineError, Entity};

// ── Availability algorithm ────────────────────────────────────────

/// Decide one requested start time against a day's window.
///
/// Order matters: a missing or disabled window wins over working hours,
/// which win over an existing booking.
pub fn evaluate_window(window: Option<&ScheduleEntry>, time: TimeOfDay, taken: bool) -> Availability {
    let Some(window) = window.filter(|w| w.is_available) else {
        return Availability::Unavailable(UnavailableReason::DayOff);
    };
    if !window.covers(time) {
        return Availability::Unavailable(UnavailableReason::OutsideWorkingHours);
    }
    if taken {
        return Availability::Unavailable(UnavailableReason::AlreadyBooked);
    }
    Availability::Available
}

/// Bookable start times: from the window start, stepping by `duration`, while
/// the whole slot still ends by the window end. Slots that would run past
/// closing are dropped, never clipped. Starts in `taken` are skipped (exact
/// start match only; a booking's duration does not shadow later starts).
pub fn generate_slots(
    window: Option<&ScheduleEntry>,
    duration: u32,
    taken: &BTreeSet<TimeOfDay>,
) -> Vec<TimeOfDay> {
    let Some(window) = window.filter(|w| w.is_available) else {
        return Vec::new();
    };
    if duration == 0 {
        return Vec::new();
    }
    let close = u32::from(window.end.minutes());
    let mut slots = Vec::new();
    let mut start = window.start;
    while let Some(end) = start.end_after(duration) {
        if end > close {
            break;
        }
        if !taken.contains(&start) {
            slots.push(start);
        }
        match u16::try_from(end).ok().and_then(TimeOfDay::from_minutes) {
            Some(next) => start = next,
            None => break,
        }
    }
    slots
}

impl Engine {
    /// Can `master_id` take a booking starting at `date` `time`?
    pub async fn check_availability(
        &self,
        master_id: Ulid,
        date: NaiveDate,
        time: TimeOfDay,
    ) -> Result<Availability, EngineError> {
        let ms = self
            .get_master(&master_id)
            .ok_or(EngineError::NotFound(Entity::Master, master_id))?;
        let guard = ms.read().await;
        if !guard.master.is_active {
            return Ok(Availability::Unavailable(UnavailableReason::MasterInactive));
        }

        let key = LedgerKey {
            scope: Scope::Master(master_id),
            date,
        };
        let window = guard.entry_for(day_of_week(date));
        Ok(evaluate_window(
            window,
            time,
            self.slot_holder(&key, time).is_some(),
        ))
    }

    /// All free start times for `master_id` on `date` for a service lasting `duration_minutes`.
    pub async fn list_available_slots(
        &self,
        master_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<TimeOfDay>, EngineError> {
        if duration_minutes == 0 {
            return Err(EngineError::invalid("slot duration must be at least one minute"));
        }
        if duration_minutes > MAX_SLOT_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("slot duration longer than a day"));
        }
        let ms = self
            .get_master(&master_id)
            .ok_or(EngineError::NotFound(Entity::Master, master_id))?;
        let guard = ms.read().await;
        if !guard.master.is_active {
            return Ok(Vec::new());
        }

        let key = LedgerKey {
            scope: Scope::Master(master_id),
            date,
        };
        let taken = self.booked_times(&key);
        Ok(generate_slots(
            guard.entry_for(day_of_week(date)),
            duration_minutes,
            &taken,
        ))
    }

    /// Slots sized by a service's own duration.
    pub async fn list_slots_for_service(
        &self,
        master_id: Ulid,
        date: NaiveDate,
        service_id: Ulid,
    ) -> Result<Vec<TimeOfDay>, EngineError> {
        let duration = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(Entity::Service, service_id))?
            .duration_minutes;
        self.list_available_slots(master_id, date, duration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        TimeOfDay::parse(s).unwrap()
    }

    fn window(start: &str, end: &str) -> ScheduleEntry {
        ScheduleEntry {
            day_of_week: 1,
            start: t(start),
            end: t(end),
            is_available: true,
        }
    }

    fn fmt(slots: &[TimeOfDay]) -> Vec<String> {
        slots.iter().map(|s| s.to_string()).collect()
    }

    // ── generate_slots ────────────────────────────────────

    #[test]
    fn hourly_slots_in_working_day() {
        let w = window("09:00", "17:00");
        let slots = generate_slots(Some(&w), 60, &BTreeSet::new());
        assert_eq!(
            fmt(&slots),
            vec!["09:00", "10:00", "11:00", "12:00", "13:00", "14:00", "15:00", "16:00"]
        );
    }

    #[test]
    fn booked_start_is_skipped() {
        let w = window("09:00", "17:00");
        let taken: BTreeSet<_> = [t("11:00")].into();
        let slots = generate_slots(Some(&w), 60, &taken);
        assert_eq!(slots.len(), 7);
        assert!(!slots.contains(&t("11:00")));
        assert!(slots.contains(&t("10:00")));
        assert!(slots.contains(&t("12:00")));
    }

    #[test]
    fn overrunning_slot_is_dropped_not_clipped() {
        let w = window("09:00", "17:00");
        let slots = generate_slots(Some(&w), 90, &BTreeSet::new());
        // 09:00 10:30 12:00 13:30 15:00; 16:30 would end at 18:00
        assert_eq!(fmt(&slots), vec!["09:00", "10:30", "12:00", "13:30", "15:00"]);
    }

    #[test]
    fn slot_ending_exactly_at_close_is_kept() {
        let w = window("09:00", "10:00");
        assert_eq!(fmt(&generate_slots(Some(&w), 60, &BTreeSet::new())), vec!["09:00"]);
        assert!(generate_slots(Some(&w), 61, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn only_exact_start_collisions_are_excluded() {
        let w = window("09:00", "12:00");
        // A booking at 09:30 doesn't block 09:00 or 10:00 on a 60-minute grid.
        let taken: BTreeSet<_> = [t("09:30")].into();
        assert_eq!(fmt(&generate_slots(Some(&w), 60, &taken)), vec!["09:00", "10:00", "11:00"]);
    }

    #[test]
    fn window_reaching_end_of_day() {
        let w = ScheduleEntry {
            day_of_week: 5,
            start: t("22:00"),
            end: t("23:59"),
            is_available: true,
        };
        assert_eq!(fmt(&generate_slots(Some(&w), 60, &BTreeSet::new())), vec!["22:00"]);
        assert_eq!(fmt(&generate_slots(Some(&w), 119, &BTreeSet::new())), vec!["22:00"]);
    }

    #[test]
    fn no_window_or_disabled_day_yields_nothing() {
        assert!(generate_slots(None, 30, &BTreeSet::new()).is_empty());
        let mut w = window("09:00", "17:00");
        w.is_available = false;
        assert!(generate_slots(Some(&w), 30, &BTreeSet::new()).is_empty());
    }

    // ── evaluate_window ───────────────────────────────────

    #[test]
    fn working_hours_are_half_open() {
        let w = window("09:00", "17:00");
        assert_eq!(
            evaluate_window(Some(&w), t("08:59"), false),
            Availability::Unavailable(UnavailableReason::OutsideWorkingHours)
        );
        assert!(evaluate_window(Some(&w), t("09:00"), false).is_available());
        assert!(evaluate_window(Some(&w), t("16:59"), false).is_available());
        assert_eq!(
            evaluate_window(Some(&w), t("17:00"), false).reason(),
            Some(UnavailableReason::OutsideWorkingHours)
        );
    }

    #[test]
    fn day_off_beats_everything() {
        let mut w = window("09:00", "17:00");
        w.is_available = false;
        assert_eq!(
            evaluate_window(Some(&w), t("10:00"), true).reason(),
            Some(UnavailableReason::DayOff)
        );
        assert_eq!(
            evaluate_window(None, t("10:00"), false).reason(),
            Some(UnavailableReason::DayOff)
        );
    }

    #[test]
    fn taken_slot_reported_last() {
        let w = window("09:00", "17:00");
        assert_eq!(
            evaluate_window(Some(&w), t("10:00"), true).reason(),
            Some(UnavailableReason::AlreadyBooked)
        );
        assert_eq!(
            evaluate_window(Some(&w), t("18:00"), true).reason(),
            Some(UnavailableReason::OutsideWorkingHours)
        );
    }
}
