use crate::config::{DEFAULT_FOLD_TEMPERATURE, RNAFOLD_ENV_BIN};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::{ErrorKind, Write},
    process::{Command, Output, Stdio},
};

/// Thermodynamic model settings passed to the structure predictor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoldSettings {
    pub temperature: f64,
    pub dangles: u8,
    pub no_lonely_pairs: bool,
}

impl Default for FoldSettings {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_FOLD_TEMPERATURE,
            dangles: 2,
            no_lonely_pairs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentroidStructure {
    pub structure: String,
    /// Mean base-pair distance of the centroid to the ensemble.
    pub distance: f64,
}

#[derive(Debug, Clone)]
pub enum RnaStructureError {
    EmptySequence,
    ToolNotFound {
        executable: String,
    },
    ToolFailed {
        executable: String,
        args: Vec<String>,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    MissingCentroid {
        executable: String,
        stdout: String,
    },
    LengthMismatch {
        sequence_length: usize,
        structure_length: usize,
    },
    Io {
        message: String,
    },
}

impl fmt::Display for RnaStructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySequence => write!(f, "RNA sequence is empty"),
            Self::ToolNotFound { executable } => write!(
                f,
                "Could not find RNAfold executable '{}'. Install ViennaRNA or set {}",
                executable, RNAFOLD_ENV_BIN
            ),
            Self::ToolFailed {
                executable,
                args,
                status,
                stdout,
                stderr,
            } => write!(
                f,
                "RNAfold command failed: {} {} (status={:?}, stdout='{}', stderr='{}')",
                executable,
                args.join(" "),
                status,
                stdout.trim(),
                stderr.trim()
            ),
            Self::MissingCentroid { executable, stdout } => write!(
                f,
                "No centroid structure in output of '{}': '{}'",
                executable,
                stdout.trim()
            ),
            Self::LengthMismatch {
                sequence_length,
                structure_length,
            } => write!(
                f,
                "Centroid structure has length {structure_length}, sequence has length {sequence_length}"
            ),
            Self::Io { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for RnaStructureError {}

pub trait StructurePredictor: Send + Sync {
    fn centroid(
        &self,
        rna: &str,
        settings: &FoldSettings,
    ) -> Result<CentroidStructure, RnaStructureError>;
}

/// ViennaRNA `RNAfold` run with partition function folding (`-p`).
#[derive(Debug, Clone)]
pub struct RnaFold {
    executable: String,
}

impl RnaFold {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.trim().to_string(),
        }
    }

    pub fn command_args(settings: &FoldSettings) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--noPS".to_string(),
            format!("--temp={}", settings.temperature),
            format!("--dangles={}", settings.dangles),
        ];
        if settings.no_lonely_pairs {
            args.push("--noLP".to_string());
        }
        args
    }

    fn run(&self, args: &[String], input: &str) -> Result<Output, RnaStructureError> {
        // -p writes dot plot files into the working directory.
        let scratch = tempfile::tempdir().map_err(|e| RnaStructureError::Io {
            message: format!("Could not create RNAfold scratch directory: {e}"),
        })?;
        let mut child = Command::new(&self.executable)
            .args(args)
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    RnaStructureError::ToolNotFound {
                        executable: self.executable.clone(),
                    }
                } else {
                    RnaStructureError::Io {
                        message: format!(
                            "Could not run RNAfold executable '{}' with args [{}]: {}",
                            self.executable,
                            args.join(" "),
                            e
                        ),
                    }
                }
            })?;
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(format!("{input}\n").as_bytes()),
            None => Ok(()),
        };
        // Reap the child before reporting a failed write.
        let output = child.wait_with_output().map_err(|e| RnaStructureError::Io {
            message: format!("Could not read RNAfold output: {e}"),
        })?;
        if output.status.success() {
            written.map_err(|e| RnaStructureError::Io {
                message: format!("Could not write sequence to RNAfold: {e}"),
            })?;
        }
        Ok(output)
    }
}

impl StructurePredictor for RnaFold {
    fn centroid(
        &self,
        rna: &str,
        settings: &FoldSettings,
    ) -> Result<CentroidStructure, RnaStructureError> {
        let sequence = normalized_rna_sequence(rna);
        if sequence.is_empty() {
            return Err(RnaStructureError::EmptySequence);
        }
        let args = Self::command_args(settings);
        let output = self.run(&args, &sequence)?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(RnaStructureError::ToolFailed {
                executable: self.executable.clone(),
                args,
                status: output.status.code(),
                stdout,
                stderr,
            });
        }

        let centroid =
            parse_centroid(&stdout).ok_or_else(|| RnaStructureError::MissingCentroid {
                executable: self.executable.clone(),
                stdout: stdout.clone(),
            })?;
        if centroid.structure.len() != sequence.len() {
            return Err(RnaStructureError::LengthMismatch {
                sequence_length: sequence.len(),
                structure_length: centroid.structure.len(),
            });
        }
        Ok(centroid)
    }
}

pub fn normalized_rna_sequence(seq: &str) -> String {
    seq.chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c.to_ascii_uppercase() {
            'T' => 'U',
            other => other,
        })
        .collect()
}

fn is_dot_bracket(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| matches!(c, '.' | '(' | ')'))
}

/// Finds the centroid line of `RNAfold -p` output, e.g. `((...)). { -1.20 d=2.31}`.
pub fn parse_centroid(stdout: &str) -> Option<CentroidStructure> {
    stdout.lines().find_map(|line| {
        let (structure, rest) = line.trim().split_once(char::is_whitespace)?;
        if !is_dot_bracket(structure) {
            return None;
        }
        let rest = rest.trim();
        let inner = rest.strip_prefix('{')?.strip_suffix('}')?;
        let (_, distance) = inner.split_once("d=")?;
        let distance = distance.trim().parse::<f64>().ok()?;
        Some(CentroidStructure {
            structure: structure.to_string(),
            distance,
        })
    })
}
