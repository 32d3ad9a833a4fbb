use std::collections::BTreeSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Server-local calendar date; bookings are compared against it date-only.
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// ISO `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::invalid(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

/// 24-hour `HH:MM`.
pub fn parse_time(s: &str) -> Result<TimeOfDay, EngineError> {
    TimeOfDay::parse(s).ok_or_else(|| EngineError::invalid(format!("bad time {s:?}, expected HH:MM")))
}

pub(crate) fn validate_booking_date(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    if date < today {
        return Err(EngineError::invalid(format!("cannot book a past date: {date}")));
    }
    Ok(())
}

impl Engine {
    /// Atomically claim `time` on the ledger day `key` for `booking_id`.
    /// This is the uniqueness constraint: the loser of a race gets `SlotTaken`.
    pub(super) fn claim_slot(
        &self,
        key: LedgerKey,
        time: TimeOfDay,
        booking_id: Ulid,
    ) -> Result<(), EngineError> {
        let mut day = self.ledger.entry(key).or_default();
        if let Some(holder) = day.get(&time) {
            return Err(EngineError::SlotTaken(*holder));
        }
        day.insert(time, booking_id);
        Ok(())
    }

    pub(super) fn slot_holder(&self, key: &LedgerKey, time: TimeOfDay) -> Option<Ulid> {
        self.ledger.get(key).and_then(|day| day.get(&time).copied())
    }

    /// The live (pending or confirmed) booking holding `time` on `date` for a
    /// master or, for bookings made without one, a service.
    pub fn find_conflicting(&self, scope: Scope, date: NaiveDate, time: TimeOfDay) -> Option<Ulid> {
        self.slot_holder(&LedgerKey { scope, date }, time)
    }

    /// Start times of live bookings on one ledger day.
    pub(super) fn booked_times(&self, key: &LedgerKey) -> BTreeSet<TimeOfDay> {
        self.ledger
            .get(key)
            .map(|day| day.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_iso_only() {
        assert_eq!(
            parse_date("2026-10-20").unwrap(),
            NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()
        );
        assert!(parse_date("20.10.2026").is_err());
        assert!(parse_date("2026-02-30").is_err());
    }

    #[test]
    fn parse_time_rejects_loose_formats() {
        assert_eq!(parse_time("10:30").unwrap().minutes(), 630);
        assert!(matches!(parse_time("10:3"), Err(EngineError::InvalidInput(_))));
        assert!(parse_time("25:00").is_err());
    }

    #[test]
    fn past_dates_rejected_today_allowed() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        assert!(validate_booking_date(today, today).is_ok());
        assert!(validate_booking_date(today.succ_opt().unwrap(), today).is_ok());
        assert!(validate_booking_date(today.pred_opt().unwrap(), today).is_err());
    }
}
