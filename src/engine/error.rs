use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or nonsensical request.
    InvalidInput(&'static str),
    /// No working shift contains the requested interval.
    OutsideWorkingHours,
    /// The requested interval intersects the given time block.
    BlockedByTimeOff(Ulid),
    /// The requested interval intersects the given appointment.
    SlotTaken(Ulid),
    /// The WAL could not be written.
    StorageFailure(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Short static label, used as a metric label.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::OutsideWorkingHours => "outside_working_hours",
            EngineError::BlockedByTimeOff(_) => "blocked_by_time_off",
            EngineError::SlotTaken(_) => "slot_taken",
            EngineError::StorageFailure(_) => "storage_failure",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::OutsideWorkingHours => {
                write!(f, "provider is not working at the requested time")
            }
            EngineError::BlockedByTimeOff(id) => {
                write!(f, "requested time falls inside time block: {id}")
            }
            EngineError::SlotTaken(id) => {
                write!(f, "requested time is already booked by appointment: {id}")
            }
            EngineError::StorageFailure(e) => write!(f, "storage failure: {e}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "appointment {id} cannot go from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
