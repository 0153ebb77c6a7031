use thiserror::Error;

/// Device failure taxonomy. Construction failures exclude the device from
/// scheduling; everything else is scoped to a single action on a single
/// device and never stops another worker.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Bus unreachable, device absent, or unrecognized model. Fatal for the
    /// affected device only.
    #[error("device construction failed: {0}")]
    Construction(String),

    /// Malformed command or an invalid/unexpected response tag. The current
    /// action is skipped; the worker continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Argument outside the model's accepted range/set. Rejected before any
    /// bus I/O.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// A bounded busy/measuring poll expired without the device settling.
    /// Recoverable: the action is skipped and its recurrence schedule kept.
    #[error("device timing: {0}")]
    Timing(String),

    /// Capability dispatch miss: the concrete model does not implement the
    /// requested operation.
    #[error("{model} does not support {operation}")]
    Unsupported {
        model: &'static str,
        operation: &'static str,
    },

    /// Raw transport failure underneath the codec.
    #[error("bus I/O failed: {0}")]
    Bus(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;
