use thiserror::Error;

/// Classified engine failures. Every job that does not complete carries
/// exactly one of these; failures are local to the job that raised them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unresolved reference '{reference}' while resolving '{root}'")]
    UnresolvedReference { root: String, reference: String },

    #[error("cyclic descriptor chain: {}", chain.join(" -> "))]
    CyclicReference { chain: Vec<String> },

    #[error(
        "memory budget exceeded: needed set is {needed_bytes} bytes but the ceiling is \
         {budget_bytes} bytes even with everything evictable evicted; reduce resolution, \
         clip length, or lower the tile size"
    )]
    BudgetExceeded { needed_bytes: u64, budget_bytes: u64 },

    #[error(
        "incompatible adapter '{adapter}': target tensor '{tensor}' has shape {expected:?} \
         but the adapter delta is {actual:?}"
    )]
    IncompatibleAdapter {
        adapter: String,
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("model backend failed at {step}: {source}")]
    BackendFailure {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid job settings: {0}")]
    InvalidSettings(String),

    #[error("unknown job {0}")]
    UnknownJob(uuid::Uuid),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short classification tag used for job status rows and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnresolvedReference { .. } => "unresolved_reference",
            Self::CyclicReference { .. } => "cyclic_reference",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::IncompatibleAdapter { .. } => "incompatible_adapter",
            Self::BackendFailure { .. } => "backend_failure",
            Self::Cancelled => "cancelled",
            Self::InvalidSettings(_) => "invalid_settings",
            Self::UnknownJob(_) => "unknown_job",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
