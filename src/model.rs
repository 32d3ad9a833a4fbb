use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit timestamps.
pub type Ms = i64;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Wall-clock time of day with minute precision, stored as minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn hm(hour: u16, minute: u16) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self(hour * 60 + minute))
    }

    /// Strict 24-hour `HH:MM`: two digits each, hour 00..=23, minute 00..=59.
    pub fn parse(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() != 5 || b[2] != b':' {
            return None;
        }
        let digit = |c: u8| c.is_ascii_digit().then(|| u16::from(c - b'0'));
        let hour = digit(b[0])? * 10 + digit(b[1])?;
        let minute = digit(b[3])? * 10 + digit(b[4])?;
        Self::hm(hour, minute)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// `self + minutes`, or `None` once it passes the end of the day.
    /// Exactly midnight of the next day is allowed as an end bound and returns `Some(1440)`.
    pub fn end_after(self, minutes: u32) -> Option<u32> {
        let end = u32::from(self.0) + minutes;
        (end <= u32::from(MINUTES_PER_DAY)).then_some(end)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Day-of-week index: 0 = Sunday … 6 = Saturday. Schedules are stored and
/// looked up with this numbering.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
    /// Minor currency units.
    pub price: i64,
    pub duration_minutes: u32,
    pub is_active: bool,
    pub category_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Master {
    pub id: Ulid,
    pub name: String,
    pub bio: Option<String>,
    pub experience_years: u8,
    pub rating: f64,
    pub is_active: bool,
}

/// One day of a master's working week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub day_of_week: u8,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub is_available: bool,
}

impl ScheduleEntry {
    /// Start inclusive, end exclusive.
    pub fn covers(&self, t: TimeOfDay) -> bool {
        self.start <= t && t < self.end
    }
}

/// In-memory state of a master: profile, linked services, and the weekly schedule
/// (sorted by day, at most one entry per day).
#[derive(Debug, Clone)]
pub struct MasterState {
    pub master: Master,
    pub services: Vec<Ulid>,
    pub schedule: Vec<ScheduleEntry>,
}

impl MasterState {
    pub fn new(master: Master) -> Self {
        Self {
            master,
            services: Vec::new(),
            schedule: Vec::new(),
        }
    }

    pub fn entry_for(&self, day: u8) -> Option<&ScheduleEntry> {
        self.schedule.iter().find(|e| e.day_of_week == day)
    }

    pub fn performs(&self, service_id: &Ulid) -> bool {
        self.services.contains(service_id)
    }

    /// Returns false if already linked.
    pub fn link(&mut self, service_id: Ulid) -> bool {
        if self.performs(&service_id) {
            return false;
        }
        self.services.push(service_id);
        true
    }

    pub fn unlink(&mut self, service_id: &Ulid) -> bool {
        let before = self.services.len();
        self.services.retain(|s| s != service_id);
        self.services.len() != before
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 5] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Rejected,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Live bookings hold their slot.
    pub fn is_live(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn allowed_transitions(self) -> &'static [BookingStatus] {
        match self {
            BookingStatus::Pending => &[
                BookingStatus::Confirmed,
                BookingStatus::Rejected,
                BookingStatus::Cancelled,
            ],
            BookingStatus::Confirmed => &[BookingStatus::Completed, BookingStatus::Cancelled],
            BookingStatus::Rejected | BookingStatus::Completed | BookingStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a slot claim is scoped to: the master when one is chosen, otherwise the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Master(Ulid),
    Service(Ulid),
}

/// Key of one day in the booking ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub scope: Scope,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub service_id: Ulid,
    pub master_id: Option<Ulid>,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub status: BookingStatus,
    pub admin_comment: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn ledger_key(&self) -> LedgerKey {
        let scope = match self.master_id {
            Some(m) => Scope::Master(m),
            None => Scope::Service(self.service_id),
        };
        LedgerKey { scope, date: self.date }
    }
}

/// One row of the append-only status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub booking_id: Ulid,
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub actor_id: Ulid,
    pub comment: Option<String>,
    pub at: Ms,
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Customer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn admin(id: Ulid) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn customer(id: Ulid) -> Self {
        Self { id, role: Role::Customer }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Availability ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    MasterInactive,
    DayOff,
    OutsideWorkingHours,
    AlreadyBooked,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnavailableReason::MasterInactive => "master is inactive",
            UnavailableReason::DayOff => "master does not work this day",
            UnavailableReason::OutsideWorkingHours => "time outside working hours",
            UnavailableReason::AlreadyBooked => "time slot already booked",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable(UnavailableReason),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }

    pub fn reason(&self) -> Option<UnavailableReason> {
        match self {
            Availability::Available => None,
            Availability::Unavailable(r) => Some(*r),
        }
    }
}

/// The WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ServiceSaved {
        service: Service,
    },
    ServiceDeleted {
        id: Ulid,
    },
    MasterSaved {
        master: Master,
    },
    MasterDeleted {
        id: Ulid,
    },
    MasterServiceLinked {
        master_id: Ulid,
        service_id: Ulid,
    },
    MasterServiceUnlinked {
        master_id: Ulid,
        service_id: Ulid,
    },
    /// Full-week replace, one record so it is atomic on replay.
    ScheduleReplaced {
        master_id: Ulid,
        entries: Vec<ScheduleEntry>,
    },
    BookingCreated {
        booking: Booking,
    },
    StatusChanged {
        change: StatusChange,
    },
    BookingDeleted {
        id: Ulid,
    },
    /// Written by compaction only.
    HistoryRestored {
        booking_id: Ulid,
        changes: Vec<StatusChange>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingStats {
    pub total: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub rejected: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminStats {
    pub today_bookings: u64,
    pub pending_bookings: u64,
    pub confirmed_bookings: u64,
    pub completed_bookings: u64,
    pub total_revenue: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDetails {
    pub booking: Booking,
    pub history: Vec<StatusChange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_parse_strict() {
        assert_eq!(TimeOfDay::parse("09:00"), TimeOfDay::hm(9, 0));
        assert_eq!(TimeOfDay::parse("23:59").map(|t| t.minutes()), Some(1439));
        assert_eq!(TimeOfDay::parse("00:00"), Some(TimeOfDay::MIDNIGHT));
        assert!(TimeOfDay::parse("9:00").is_none());
        assert!(TimeOfDay::parse("24:00").is_none());
        assert!(TimeOfDay::parse("12:60").is_none());
        assert!(TimeOfDay::parse("12-30").is_none());
        assert!(TimeOfDay::parse("12:3a").is_none());
        assert!(TimeOfDay::parse(" 12:30").is_none());
    }

    #[test]
    fn time_display_zero_padded() {
        assert_eq!(TimeOfDay::hm(7, 5).unwrap().to_string(), "07:05");
        assert_eq!(TimeOfDay::hm(16, 30).unwrap().to_string(), "16:30");
    }

    #[test]
    fn end_after_bounds() {
        let t = TimeOfDay::hm(23, 0).unwrap();
        assert_eq!(t.end_after(60), Some(1440));
        assert_eq!(t.end_after(61), None);
    }

    #[test]
    fn day_of_week_sunday_is_zero() {
        // 2026-10-18 is a Sunday, 2026-10-24 a Saturday.
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()), 0);
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()), 1);
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2026, 10, 24).unwrap()), 6);
    }

    #[test]
    fn transition_table() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Confirmed.can_transition_to(Rejected));
        assert!(!Confirmed.can_transition_to(Pending));
        for terminal in [Rejected, Completed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in BookingStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn status_parse_and_liveness() {
        assert_eq!(BookingStatus::parse("confirmed"), Some(BookingStatus::Confirmed));
        assert_eq!(BookingStatus::parse("CANCELLED"), Some(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::parse("done"), None);
        assert!(BookingStatus::Pending.is_live());
        assert!(BookingStatus::Confirmed.is_live());
        assert!(!BookingStatus::Completed.is_live());
    }

    #[test]
    fn ledger_key_scope() {
        let mut b = Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            service_id: Ulid::new(),
            master_id: None,
            date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
            time: TimeOfDay::hm(10, 0).unwrap(),
            status: BookingStatus::Pending,
            admin_comment: None,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(b.ledger_key().scope, Scope::Service(b.service_id));
        let m = Ulid::new();
        b.master_id = Some(m);
        assert_eq!(b.ledger_key().scope, Scope::Master(m));
    }

    #[test]
    fn schedule_entry_covers_half_open() {
        let e = ScheduleEntry {
            day_of_week: 1,
            start: TimeOfDay::hm(9, 0).unwrap(),
            end: TimeOfDay::hm(17, 0).unwrap(),
            is_available: true,
        };
        assert!(e.covers(TimeOfDay::hm(9, 0).unwrap()));
        assert!(e.covers(TimeOfDay::hm(16, 59).unwrap()));
        assert!(!e.covers(TimeOfDay::hm(17, 0).unwrap()));
        assert!(!e.covers(TimeOfDay::hm(8, 59).unwrap()));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ScheduleReplaced {
            master_id: Ulid::new(),
            entries: vec![ScheduleEntry {
                day_of_week: 6,
                start: TimeOfDay::hm(10, 0).unwrap(),
                end: TimeOfDay::hm(14, 0).unwrap(),
                is_available: true,
            }],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
