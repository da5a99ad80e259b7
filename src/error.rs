use thiserror::Error;

/// Errors surfaced by the measurement core and its configuration boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TankError {
    /// Invalid filter or pipeline parameters. Fatal at setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A threshold outside its valid domain. The previous value is kept.
    #[error("value out of range: {0}")]
    Range(String),

    /// A single raw read failed. The cycle is skipped.
    #[error("sensor read failed: {0}")]
    TransientRead(String),

    #[error("frequency counter is already running")]
    AlreadyRunning,

    #[error("frequency counter is not running")]
    NotRunning,

    /// The external config store rejected a write.
    #[error("could not persist configuration: {0}")]
    Storage(String),
}

impl TankError {
    pub fn transient(err: anyhow::Error) -> Self {
        TankError::TransientRead(format!("{:#}", err))
    }

    pub fn storage(err: anyhow::Error) -> Self {
        TankError::Storage(format!("{:#}", err))
    }
}
