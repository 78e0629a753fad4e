use thiserror::Error;

/// nodevm error types
#[derive(Error, Debug)]
pub enum VmError {
    /// Backend lifecycle error.
    ///
    /// Fatal errors abort the lifecycle operation and drive the backend to
    /// `Error`; non-fatal ones abort the current sequence only.
    #[error("{message}")]
    Backend {
        message: String,
        fatal: bool,
        hint: Option<String>,
    },

    /// A host or guest command exited unsuccessfully
    #[error("Command `{command}` failed ({}): {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The user declined the elevation prompt
    #[error("Privilege escalation denied: {0}")]
    PrivilegeDenied(String),

    /// A privileged command cannot be wrapped safely
    #[error("Unsafe privileged command: {0}")]
    UnsafeCommand(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// HTTP probe error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl VmError {
    /// A backend error that moves the backend to `Error`.
    pub fn fatal(message: impl Into<String>) -> Self {
        VmError::Backend {
            message: message.into(),
            fatal: true,
            hint: None,
        }
    }

    /// A fatal backend error with a user-facing remediation hint.
    pub fn fatal_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        VmError::Backend {
            message: message.into(),
            fatal: true,
            hint: Some(hint.into()),
        }
    }

    /// A backend error that aborts the current sequence only.
    pub fn non_fatal(message: impl Into<String>) -> Self {
        VmError::Backend {
            message: message.into(),
            fatal: false,
            hint: None,
        }
    }

    /// Everything except a non-fatal backend error is fatal to a lifecycle
    /// operation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VmError::Backend { fatal: false, .. })
    }

    /// Remediation hint, if any.
    pub fn hint(&self) -> Option<&str> {
        match self {
            VmError::Backend { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for VmError {
    fn from(err: serde_json::Error) -> Self {
        VmError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for VmError {
    fn from(err: serde_yaml::Error) -> Self {
        VmError::SerializationError(err.to_string())
    }
}

/// Result type alias for nodevm operations
pub type Result<T> = std::result::Result<T, VmError>;
