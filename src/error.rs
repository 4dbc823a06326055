use crate::rna_structure::RnaStructureError;
use thiserror::Error;

pub type Result<T, E = DesignError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DesignError {
    #[error("Unknown target filter policy '{0}' (expected 'none' or 'aligner')")]
    UnknownFilterPolicy(String),

    #[error("Invalid recognition pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid RNA scaffold template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    #[error("Invalid locus {id}: {message}")]
    InvalidLocus { id: u64, message: String },

    #[error("Locus {0} not found")]
    UnknownLocus(u64),

    #[error("Recognition system {0} not found")]
    UnknownSystem(u64),

    #[error("No genome index for strain '{strain}' at '{path}'")]
    GenomeIndexMissing { strain: String, path: String },

    #[error("Could not find executable '{executable}'. Install it or set {env_var}")]
    ToolNotFound { executable: String, env_var: String },

    #[error(
        "{executable} failed: {} (status={status:?}, stdout='{}', stderr='{}')",
        .args.join(" "),
        .stdout.trim(),
        .stderr.trim()
    )]
    ToolFailed {
        executable: String,
        args: Vec<String>,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Could not parse output of {executable}: {message}")]
    ToolOutput { executable: String, message: String },

    #[error(transparent)]
    StructurePrediction(#[from] RnaStructureError),

    #[error("Invalid oligo expression '{expression}': {message}")]
    OligoExpression { expression: String, message: String },

    #[error("Background search worker terminated without a result")]
    WorkerLost,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DesignError {
    /// True for failures of an external program, as opposed to bad input or configuration.
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound { .. }
                | Self::ToolFailed { .. }
                | Self::ToolOutput { .. }
                | Self::StructurePrediction(_)
        )
    }
}
