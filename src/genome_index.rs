use crate::error::{DesignError, Result};
use std::path::{Path, PathBuf};

pub const DEFAULT_GENOMES_DIR: &str = "./data";

/// First file of a bowtie index, small and large variants.
const INDEX_MARKER_SUFFIXES: [&str; 2] = [".1.ebwt", ".1.ebwtl"];

/// Resolves a strain name to the basename of its prebuilt aligner index.
pub trait GenomeIndexLocator: Send + Sync {
    fn index_for_strain(&self, strain: &str) -> Result<PathBuf>;
}

/// Indices live side by side in one directory, one basename per strain
/// (`<genomes_dir>/<strain>.1.ebwt`, ...).
#[derive(Debug, Clone)]
pub struct DirectoryGenomeIndex {
    genomes_dir: PathBuf,
    require_existing: bool,
}

impl DirectoryGenomeIndex {
    pub fn new(genomes_dir: impl Into<PathBuf>) -> Self {
        Self {
            genomes_dir: genomes_dir.into(),
            require_existing: true,
        }
    }

    /// Skip the on-disk check; the aligner reports a missing index itself.
    pub fn unchecked(genomes_dir: impl Into<PathBuf>) -> Self {
        Self {
            require_existing: false,
            ..Self::new(genomes_dir)
        }
    }

    fn index_exists(basename: &Path) -> bool {
        INDEX_MARKER_SUFFIXES.iter().any(|suffix| {
            let mut marker = basename.as_os_str().to_owned();
            marker.push(suffix);
            Path::new(&marker).exists()
        })
    }
}

impl GenomeIndexLocator for DirectoryGenomeIndex {
    fn index_for_strain(&self, strain: &str) -> Result<PathBuf> {
        let name = strain.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(DesignError::GenomeIndexMissing {
                strain: strain.to_string(),
                path: self.genomes_dir.display().to_string(),
            });
        }
        let basename = self.genomes_dir.join(name);
        if self.require_existing && !Self::index_exists(&basename) {
            return Err(DesignError::GenomeIndexMissing {
                strain: strain.to_string(),
                path: basename.display().to_string(),
            });
        }
        Ok(basename)
    }
}
