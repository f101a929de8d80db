use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown timer '{0}'")]
    UnknownTimer(String),
    #[error("unknown alarm '{0}'")]
    UnknownAlarm(String),
    #[error("{kind} limit reached ({limit} allowed)")]
    LimitExceeded { kind: &'static str, limit: usize },
    #[error("'{0}' is a built-in entry and cannot be deleted")]
    DefaultNotDeletable(String),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("invalid target date '{0}'")]
    InvalidTargetDate(String),
    #[error("invalid alarm time {hour:02}:{minute:02}")]
    InvalidAlarmTime { hour: u32, minute: u32 },
    #[error("timer '{id}' is not a {expected} timer")]
    WrongTimerKind { id: String, expected: &'static str },
    #[error("storage error: {0}")]
    Storage(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
