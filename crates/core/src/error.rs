use thiserror::Error;

use crate::resilience::Collaborator;

#[derive(Error, Debug)]
pub enum TriageError {
    #[error("circuit open for {collaborator}, call refused")]
    CircuitOpen { collaborator: Collaborator },
    #[error("{collaborator} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        collaborator: Collaborator,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("malformed {stage} output: {detail}")]
    MalformedOutput { stage: &'static str, detail: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

impl TriageError {
    /// True for failures of an external collaborator, as opposed to local
    /// validation problems.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            TriageError::CircuitOpen { .. }
                | TriageError::RetriesExhausted { .. }
                | TriageError::Upstream(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TriageError>;

impl From<toml::de::Error> for TriageError {
    fn from(value: toml::de::Error) -> Self {
        Self::Config(value.to_string())
    }
}
