use thiserror::Error;

/// The kernel's typed error taxonomy, replacing exception-style propagation
/// with an explicit discriminant. `kernel-server::grpc` maps each variant to
/// its `tonic::Status` code.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not leader")]
    NotLeader {
        leader_addr: Option<String>,
        retry_after_ms: u64,
    },

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("persistence transient error: {0}")]
    PersistenceTransient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KernelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        KernelError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        KernelError::Conflict(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        KernelError::PersistenceTransient(msg.into())
    }
}

/// Any error bubbling up from a `KernelStore` adapter is treated as
/// transient persistence trouble unless the adapter already classified it.
impl From<anyhow::Error> for KernelError {
    fn from(e: anyhow::Error) -> Self {
        KernelError::PersistenceTransient(format!("{e:#}"))
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
