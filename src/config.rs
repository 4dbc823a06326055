use crate::{
    error::{DesignError, Result},
    genome_index::DEFAULT_GENOMES_DIR,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

pub const GENOMES_DIR_ENV: &str = "GENOMES_DIR";
pub const BOWTIE_ENV_BIN: &str = "YEASTRICTION_BOWTIE_BIN";
pub const RNAFOLD_ENV_BIN: &str = "YEASTRICTION_RNAFOLD_BIN";
pub const PRIMER3_ENV_BIN: &str = "YEASTRICTION_PRIMER3_BIN";

pub const DEFAULT_BOWTIE_BIN: &str = "bowtie";
pub const DEFAULT_RNAFOLD_BIN: &str = "RNAfold";
pub const DEFAULT_PRIMER3_BIN: &str = "primer3_core";
pub const DEFAULT_FOLD_TEMPERATURE: f64 = 30.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DesignConfig {
    pub genomes_dir: PathBuf,
    pub aligner_bin: String,
    pub rnafold_bin: String,
    pub primer3_bin: String,
    pub fold_temperature: f64,
    /// Alignments reported per variant read (`bowtie -k`).
    pub max_alignments: u32,
    /// Mismatches tolerated per alignment (`bowtie -v`).
    pub max_mismatches: u32,
}

impl Default for DesignConfig {
    fn default() -> Self {
        Self {
            genomes_dir: PathBuf::from(DEFAULT_GENOMES_DIR),
            aligner_bin: DEFAULT_BOWTIE_BIN.to_string(),
            rnafold_bin: DEFAULT_RNAFOLD_BIN.to_string(),
            primer3_bin: DEFAULT_PRIMER3_BIN.to_string(),
            fold_temperature: DEFAULT_FOLD_TEMPERATURE,
            max_alignments: 2,
            max_mismatches: 3,
        }
    }
}

fn normalized_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl DesignConfig {
    pub fn from_json_file(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Defaults, or the JSON file if given, with environment variables applied on top.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_json_file(path).map_err(|e| match e {
                DesignError::Io(io) => DesignError::Io(std::io::Error::new(
                    io.kind(),
                    format!("Could not read config '{path}': {io}"),
                )),
                other => other,
            })?,
            None => Self::default(),
        };
        Ok(base.with_env(|key| std::env::var(key).ok()))
    }

    /// Applies overrides from `lookup`; blank values are ignored.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).and_then(|v| normalized_non_empty(&v));
        if let Some(dir) = get(GENOMES_DIR_ENV) {
            self.genomes_dir = PathBuf::from(dir);
        }
        if let Some(bin) = get(BOWTIE_ENV_BIN) {
            self.aligner_bin = bin;
        }
        if let Some(bin) = get(RNAFOLD_ENV_BIN) {
            self.rnafold_bin = bin;
        }
        if let Some(bin) = get(PRIMER3_ENV_BIN) {
            self.primer3_bin = bin;
        }
        self
    }
}
