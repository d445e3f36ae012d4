use thiserror::Error;

/// Errors surfaced at the public tracer boundary.
#[derive(Debug, Error)]
pub enum TracerError {
    #[error("kernel {found_major}.{found_minor} is not supported; require >= {min_major}.{min_minor}")]
    UnsupportedKernel {
        found_major: u32,
        found_minor: u32,
        min_major: u32,
        min_minor: u32,
    },

    #[error("missing capability: {0}")]
    MissingCapability(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("tracer is already running")]
    AlreadyRunning,

    #[error("tracer is not initialized")]
    NotInitialized,

    #[error("failed to load BPF object: {0}")]
    Load(anyhow::Error),

    #[error("failed to attach {probe}: {reason}")]
    Attach { probe: String, reason: anyhow::Error },

    #[error("extra event type {0:#x} is below the registered-event range")]
    EventTypeOutOfRange(u32),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
