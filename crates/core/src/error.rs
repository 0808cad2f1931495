use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("Lease timeout {0:?} must be between 1s and one year")]
    LeaseTimeout(std::time::Duration),

    #[error("Invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
}
