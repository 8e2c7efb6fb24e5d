use thiserror::Error;

/// Error raised while reproducing a single job or packaging a job pair.
///
/// Workers never terminate the process on a per-job error; the variant is
/// recorded as the item's `err_reason` and the queue moves on. Only
/// `InvalidInput` and `DiskExhausted` are fatal for the whole task.
#[derive(Error, Debug)]
pub enum ReproduceError {
    #[error("Repo Clone/Copy Error: {0}")]
    RepoClone(String),

    #[error("Repo Setup Error: {0}")]
    RepoSetup(String),

    #[error("Git Error: {0}")]
    Git(String),

    #[error("Docker Error: {0}")]
    Docker(String),

    #[error("Reproduction Timeout: container exceeded {0} seconds")]
    Timeout(u64),

    #[error("GHA Expression Parse Error: {0}")]
    ExpressionParse(String),

    #[error("GHA Context Error: {0}")]
    Context(String),

    #[error("Unsupported GHA Feature: {0}")]
    UnsupportedWorkflow(String),

    #[error("Invalid Predefined Action: {0}")]
    InvalidPredefinedAction(String),

    #[error("API request failed: {0}")]
    Api(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Inadequate disk space even after pruning: {0}")]
    DiskExhausted(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReproduceError {
    /// True when the error should stop the whole task rather than a single
    /// queue item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReproduceError::InvalidInput(_) | ReproduceError::DiskExhausted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReproduceError>;
