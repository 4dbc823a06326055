use crate::{
    error::{DesignError, Result},
    model::{Locus, Strand},
    sequence_utils::reverse_complement,
};
use regex::Regex;

pub const GROUP_WITH_PAM: &str = "target_sequence_with_pam";
pub const GROUP_WITHOUT_PAM: &str = "target_sequence_without_pam";

/// Poly-T run that terminates Pol III transcription of the guide.
pub const TERMINATOR_RUN: &str = "TTTTTT";

/// A pattern match before filtering and scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCandidate {
    pub strand: Strand,
    pub position: usize,
    pub sequence: String,
    pub sequence_wo_pam: String,
}

#[derive(Debug, Clone)]
pub struct SiteScanner {
    pattern: Regex,
}

impl SiteScanner {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| DesignError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        for group in [GROUP_WITH_PAM, GROUP_WITHOUT_PAM] {
            if !regex.capture_names().flatten().any(|name| name == group) {
                return Err(DesignError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: format!("missing named group '{group}'"),
                });
            }
        }
        Ok(Self { pattern: regex })
    }

    /// Non-overlapping matches on the coding region, forward strand first, then
    /// its reverse complement. Candidates with a terminator run are dropped.
    pub fn scan_locus(&self, locus: &Locus) -> Vec<RawCandidate> {
        self.scan(locus.coding_sequence())
    }

    pub fn scan(&self, coding_sequence: &str) -> Vec<RawCandidate> {
        let reverse = reverse_complement(coding_sequence);
        let mut ret = self.scan_strand(coding_sequence, Strand::Forward);
        ret.extend(self.scan_strand(&reverse, Strand::Reverse));
        ret.retain(|c| !c.sequence_wo_pam.contains(TERMINATOR_RUN));
        ret
    }

    fn scan_strand(&self, sequence: &str, strand: Strand) -> Vec<RawCandidate> {
        self.pattern
            .captures_iter(sequence)
            .filter_map(|caps| {
                let with_pam = caps.name(GROUP_WITH_PAM)?;
                let without_pam = caps.name(GROUP_WITHOUT_PAM)?;
                Some(RawCandidate {
                    strand,
                    position: with_pam.start(),
                    sequence: with_pam.as_str().to_string(),
                    sequence_wo_pam: without_pam.as_str().to_string(),
                })
            })
            .collect()
    }
}
