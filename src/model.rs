use crate::error::{DesignError, Result};
use crate::sequence_utils::{is_iupac_dna, reverse_complement};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub type LocusId = u64;
pub type SystemId = u64;

/// Placeholder in a scaffold template that receives the PAM-free target.
pub const TARGET_SLOT: &str = "{target_sequence_without_pam}";

/// Bases kept on each side of the excision in repair oligos.
pub const REPAIR_ARM_LEN: usize = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Locus {
    pub id: LocusId,
    pub orf: String,
    #[serde(default)]
    pub symbol: Option<String>,
    pub strain: String,
    pub sequence: String,
    /// 0-based, inclusive.
    pub start_orf: usize,
    /// 0-based, exclusive.
    pub end_orf: usize,
}

impl Locus {
    pub fn validate(&self) -> Result<()> {
        if !is_iupac_dna(&self.sequence) {
            return Err(DesignError::InvalidLocus {
                id: self.id,
                message: "sequence contains letters that are not nucleotide codes".to_string(),
            });
        }
        if self.start_orf >= self.end_orf || self.end_orf > self.sequence.len() {
            return Err(DesignError::InvalidLocus {
                id: self.id,
                message: format!(
                    "coding region {}..{} does not fit a sequence of length {}",
                    self.start_orf,
                    self.end_orf,
                    self.sequence.len()
                ),
            });
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        match self.symbol.as_deref() {
            Some(symbol) if !symbol.trim().is_empty() => symbol,
            _ => &self.orf,
        }
    }

    /// Empty for a locus that does not pass [`Locus::validate`].
    pub fn coding_sequence(&self) -> &str {
        self.sequence.get(self.start_orf..self.end_orf).unwrap_or("")
    }

    pub fn upstream_flank_len(&self) -> usize {
        self.start_orf
    }

    pub fn downstream_flank_len(&self) -> usize {
        self.sequence.len().saturating_sub(self.end_orf)
    }

    /// Homology arms flanking the coding region, joined. Arms are clamped to the
    /// sequence ends when a flank is shorter than the arm length.
    pub fn repair_oligo_fw(&self) -> String {
        let left = self.start_orf.saturating_sub(REPAIR_ARM_LEN);
        let right = (self.end_orf + REPAIR_ARM_LEN).min(self.sequence.len());
        format!(
            "{}{}",
            self.sequence.get(left..self.start_orf).unwrap_or(""),
            self.sequence.get(self.end_orf..right).unwrap_or("")
        )
    }

    pub fn repair_oligo_rv(&self) -> String {
        reverse_complement(&self.repair_oligo_fw())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Strand {
    Forward,
    Reverse,
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "+"),
            Self::Reverse => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPolicy {
    None,
    Aligner,
}

impl FromStr for FilterPolicy {
    type Err = DesignError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "none" | "no_filter" => Ok(Self::None),
            "aligner" | "filter_cas9_targets_with_bowtie" => Ok(Self::Aligner),
            other => Err(DesignError::UnknownFilterPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OligoRule {
    pub suffix: String,
    #[serde(alias = "function")]
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OligoBuildMethod {
    pub name: String,
    #[serde(alias = "oligos")]
    pub rules: Vec<OligoRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecognitionSystem {
    pub id: SystemId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Regex with the named groups `target_sequence_with_pam` and
    /// `target_sequence_without_pam`.
    #[serde(alias = "recognition_sequence_regexp")]
    pub recognition_pattern: String,
    /// RNA scaffold containing [`TARGET_SLOT`] exactly once.
    #[serde(alias = "rna_template_sequence")]
    pub rna_template: String,
    /// Kept as text so that an unknown policy fails the batch, not the load.
    #[serde(alias = "target_filter_function")]
    pub target_filter: String,
    #[serde(default)]
    pub oligo_build_methods: Vec<OligoBuildMethod>,
}

impl RecognitionSystem {
    pub fn filter_policy(&self) -> Result<FilterPolicy> {
        self.target_filter.parse()
    }

    pub fn build_method(&self, name: &str) -> Option<&OligoBuildMethod> {
        self.oligo_build_methods.iter().find(|m| m.name == name)
    }

    pub fn build_method_names(&self) -> Vec<&str> {
        self.oligo_build_methods
            .iter()
            .map(|m| m.name.as_str())
            .collect()
    }

    /// S. pyogenes Cas9 with an NGG PAM and the pROS / pMEL cloning oligos.
    pub fn cas9_ngg() -> Self {
        const PROMOTER_ARM: &str = "tgcgcatgtttcggcgttcgaaacttctccgcagtgaaagataaatgatc";
        const PROS_ARM: &str = "gttttagagctagaaatagcaagttaaaataag";
        const PMEL_ARM: &str = "gttttagagctagaaatagcaagttaaaataaggctagtccgttatcaac";

        let pmel_fw = format!("\"{PROMOTER_ARM}\" + target.sequence_wo_pam + \"{PMEL_ARM}\"");
        Self {
            id: 1,
            name: "Cas9 (NGG)".to_string(),
            description: Some("CRISPR system with S. pyogenes Cas9 nuclease".to_string()),
            recognition_pattern: "(?P<target_sequence_with_pam>(?P<target_sequence_without_pam>[ATGC]{20})(?P<pam_sequence>[ATGC]GG))".to_string(),
            rna_template: format!(
                "{TARGET_SLOT}GTTTTAGAGCTAGAAATAGCAAGTTAAAATAAGGCTAGTCCGTTATCAACTTGAAAAAGTGGCACCGAGTCGGTGGTGCTTTTTT"
            ),
            target_filter: "aligner".to_string(),
            oligo_build_methods: vec![
                OligoBuildMethod {
                    name: "pROS".to_string(),
                    rules: vec![OligoRule {
                        suffix: " pROS fw".to_string(),
                        expression: format!(
                            "\"{PROMOTER_ARM}\" + target.sequence_wo_pam + \"{PROS_ARM}\""
                        ),
                    }],
                },
                OligoBuildMethod {
                    name: "pMEL".to_string(),
                    rules: vec![
                        OligoRule {
                            suffix: " pMEL fw".to_string(),
                            expression: pmel_fw.clone(),
                        },
                        OligoRule {
                            suffix: " pMEL rv".to_string(),
                            expression: format!("reverse_complement({pmel_fw})"),
                        },
                    ],
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FoldResult {
    /// Centroid structure of the full scaffold, dot-bracket.
    pub notation: String,
    /// Slice of `notation` covering the target.
    pub notation_binding_only: String,
    /// Fraction of unpaired bases in `notation_binding_only`.
    pub accessibility: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub locus_id: LocusId,
    pub system_id: SystemId,
    pub strand: Strand,
    /// 0-based start of the match on the strand's coding-region sequence.
    pub position: usize,
    pub sequence: String,
    pub sequence_wo_pam: String,
    pub gc_content: f64,
    pub fold: FoldResult,
    pub composite_score: f64,
}

impl Candidate {
    pub fn at_content(&self) -> f64 {
        1.0 - self.gc_content
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticPrimerPair {
    pub locus_id: LocusId,
    pub forward: String,
    pub reverse: String,
}

impl DiagnosticPrimerPair {
    pub fn empty(locus_id: LocusId) -> Self {
        Self {
            locus_id,
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.forward.is_empty() && !self.reverse.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locus(sequence: &str, start_orf: usize, end_orf: usize) -> Locus {
        Locus {
            id: 7,
            orf: "YAL001C".to_string(),
            symbol: None,
            strain: "CEN.PK".to_string(),
            sequence: sequence.to_string(),
            start_orf,
            end_orf,
        }
    }

    #[test]
    fn test_locus_validate() {
        assert!(locus("AAAACCCCTTTT", 4, 8).validate().is_ok());
        assert!(locus("AAAACCCCTTTT", 8, 8).validate().is_err());
        assert!(locus("AAAACCCCTTTT", 4, 13).validate().is_err());
    }

    #[test]
    fn test_non_nucleotide_sequence_is_invalid() {
        let sequence = format!("AAA\u{e9}{}", "ACGT".repeat(10));
        let l = locus(&sequence, 4, 20);
        assert!(matches!(
            l.validate(),
            Err(DesignError::InvalidLocus { id: 7, .. })
        ));
        // Byte offsets inside a multi-byte letter do not panic.
        assert_eq!(l.coding_sequence(), "");
        assert_eq!(l.repair_oligo_fw(), &sequence[20..]);
        assert!(locus("ACGTNNRYacgt", 2, 6).validate().is_ok());
    }

    #[test]
    fn test_display_name_prefers_symbol() {
        let mut l = locus("AAAACCCCTTTT", 4, 8);
        assert_eq!(l.display_name(), "YAL001C");
        l.symbol = Some("".to_string());
        assert_eq!(l.display_name(), "YAL001C");
        l.symbol = Some("TFC3".to_string());
        assert_eq!(l.display_name(), "TFC3");
    }

    #[test]
    fn test_repair_oligos_join_flanks() {
        let seq = format!("{}{}{}", "A".repeat(70), "C".repeat(30), "G".repeat(70));
        let l = locus(&seq, 70, 100);
        let fw = l.repair_oligo_fw();
        assert_eq!(fw, format!("{}{}", "A".repeat(60), "G".repeat(60)));
        assert_eq!(l.repair_oligo_rv(), format!("{}{}", "C".repeat(60), "T".repeat(60)));
    }

    #[test]
    fn test_repair_oligos_clamp_short_flanks() {
        let l = locus("AAAACCCCTTTT", 4, 8);
        assert_eq!(l.repair_oligo_fw(), "AAAATTTT");
    }

    #[test]
    fn test_filter_policy_parsing() {
        assert_eq!("none".parse::<FilterPolicy>().unwrap(), FilterPolicy::None);
        assert_eq!(
            "filter_cas9_targets_with_bowtie"
                .parse::<FilterPolicy>()
                .unwrap(),
            FilterPolicy::Aligner
        );
        let err = "blast".parse::<FilterPolicy>().unwrap_err();
        assert!(matches!(err, DesignError::UnknownFilterPolicy(p) if p == "blast"));
    }

    #[test]
    fn test_system_loads_legacy_field_names() {
        let json = r#"{
            "id": 3,
            "name": "legacy",
            "recognition_sequence_regexp": "(?P<target_sequence_with_pam>(?P<target_sequence_without_pam>[ATGC]{20})[ATGC]GG)",
            "rna_template_sequence": "{target_sequence_without_pam}GUUU",
            "target_filter_function": "no_filter",
            "oligo_build_methods": [
                {"name": "m", "oligos": [{"suffix": " fw", "function": "target[\"sequence_wo_pam\"]"}]}
            ]
        }"#;
        let system: RecognitionSystem = serde_json::from_str(json).unwrap();
        assert_eq!(system.filter_policy().unwrap(), FilterPolicy::None);
        assert_eq!(system.build_method("m").unwrap().rules[0].suffix, " fw");
        assert!(system.build_method("other").is_none());
    }

    #[test]
    fn test_cas9_defaults() {
        let system = RecognitionSystem::cas9_ngg();
        assert_eq!(system.filter_policy().unwrap(), FilterPolicy::Aligner);
        assert_eq!(system.build_method_names(), vec!["pROS", "pMEL"]);
        assert_eq!(system.rna_template.matches(TARGET_SLOT).count(), 1);
    }

    #[test]
    fn test_diagnostic_pair_completeness() {
        let mut pair = DiagnosticPrimerPair::empty(1);
        assert!(!pair.is_complete());
        pair.forward = "ACGT".to_string();
        assert!(!pair.is_complete());
        pair.reverse = "TTGA".to_string();
        assert!(pair.is_complete());
    }
}
