use chrono::NaiveDate;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Date lies before today.
    InvalidDate(NaiveDate),
    InvalidDayOfWeek(u8),
    /// A window starts after it ends, or the two windows overlap.
    InvalidStartTime,
    InvalidTimeInterval(u32),
    InvalidDuration(u32),
    /// Closed-slot mutation on a date without an override.
    TimeSlotNotFound(NaiveDate),
    TimeSlotNotAvailable,
    ServiceNotFound(Ulid),
    UserNotFound(Ulid),
    BarberNotFound(Ulid),
    BookingNotFound(Ulid),
    AlreadyExists(Ulid),
    /// Phone number already registered to another user or barber.
    PhoneInUse(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDate(d) => write!(f, "invalid date: {d} is in the past"),
            EngineError::InvalidDayOfWeek(d) => {
                write!(f, "invalid day of week: {d} (expected 1-7)")
            }
            EngineError::InvalidStartTime => {
                write!(f, "invalid start time: a window starts after it ends or windows overlap")
            }
            EngineError::InvalidTimeInterval(i) => write!(
                f,
                "invalid time interval: {i} minutes (expected {}-{})",
                crate::limits::MIN_INTERVAL_MINUTES,
                crate::limits::MAX_INTERVAL_MINUTES
            ),
            EngineError::InvalidDuration(d) => write!(
                f,
                "invalid service duration: {d} slots (expected 1-{})",
                crate::limits::MAX_DURATION_SLOTS
            ),
            EngineError::TimeSlotNotFound(d) => write!(f, "no schedule override on {d}"),
            EngineError::TimeSlotNotAvailable => write!(f, "time slot not available"),
            EngineError::ServiceNotFound(id) => write!(f, "service not found: {id}"),
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::BarberNotFound(id) => write!(f, "barber not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::PhoneInUse(p) => write!(f, "phone number already registered: {p}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
