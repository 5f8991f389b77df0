use thiserror::Error;

/// Canonical result for the compiler.
pub type Result<T> = std::result::Result<T, Error>;

/// Every pass reports through one of these kinds. A failing pass aborts the
/// whole compilation; no partial outputs are written.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument in {pass}: {reason}")]
    Argument { pass: String, reason: String },

    #[error("logic error in {pass}: {reason}")]
    Logic { pass: String, reason: String },

    #[error("runtime error in {pass}: {reason}")]
    Runtime { pass: String, reason: String },

    #[error("op error on '{op}' in {pass}: {reason}")]
    Op {
        pass: String,
        op: String,
        reason: String,
    },

    #[error("index out of range in {pass}: {reason}")]
    Index { pass: String, reason: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Logic {
            pass: "serde".to_string(),
            reason: e.to_string(),
        }
    }
}

impl Error {
    pub fn argument(pass: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Argument {
            pass: pass.into(),
            reason: reason.into(),
        }
    }

    pub fn logic(pass: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Logic {
            pass: pass.into(),
            reason: reason.into(),
        }
    }

    pub fn runtime(pass: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Runtime {
            pass: pass.into(),
            reason: reason.into(),
        }
    }

    pub fn op(
        pass: impl Into<String>,
        op: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Op {
            pass: pass.into(),
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn index(pass: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Index {
            pass: pass.into(),
            reason: reason.into(),
        }
    }

    /// Stable exit-code mapping for a driver binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Argument { .. } => 2,
            Error::Logic { .. } => 3,
            Error::Runtime { .. } => 4,
            Error::Op { .. } => 5,
            Error::Index { .. } => 6,
        }
    }
}
