use crate::{
    error::{DesignError, Result},
    model::{Candidate, FoldResult, Locus, RecognitionSystem, TARGET_SLOT},
    rna_structure::{FoldSettings, StructurePredictor},
    scanner::RawCandidate,
    sequence_utils::{gc_content, unpaired_fraction},
};
use itertools::{Itertools, MinMaxResult};
use log::debug;

/// Value of a normalized term when the whole batch shares one value on that axis.
pub const DEGENERATE_RANGE_FALLBACK: f64 = 0.0;

/// The RNA scaffold of a recognition system, with its target slot located once.
#[derive(Debug, Clone)]
pub struct ScaffoldTemplate {
    template: String,
    slot_offset: usize,
}

impl ScaffoldTemplate {
    pub fn new(template: &str) -> Result<Self> {
        let invalid = |message: &str| DesignError::InvalidTemplate {
            template: template.to_string(),
            message: message.to_string(),
        };
        let slot_offset = match template.matches(TARGET_SLOT).count() {
            1 => template
                .find(TARGET_SLOT)
                .ok_or_else(|| invalid("target slot vanished"))?,
            0 => return Err(invalid("missing target slot")),
            _ => return Err(invalid("more than one target slot")),
        };
        Ok(Self {
            template: template.to_string(),
            slot_offset,
        })
    }

    pub fn for_system(system: &RecognitionSystem) -> Result<Self> {
        Self::new(&system.rna_template)
    }

    /// Offset of the target within every substituted scaffold.
    pub fn slot_offset(&self) -> usize {
        self.slot_offset
    }

    pub fn substitute(&self, sequence_wo_pam: &str) -> String {
        self.template.replacen(TARGET_SLOT, sequence_wo_pam, 1)
    }
}

/// Per-candidate metrics before batch normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSite {
    pub raw: RawCandidate,
    pub gc_content: f64,
    pub fold: FoldResult,
}

pub fn score_site(
    raw: RawCandidate,
    scaffold: &ScaffoldTemplate,
    predictor: &dyn StructurePredictor,
    settings: &FoldSettings,
) -> Result<ScoredSite> {
    let target_len = raw.sequence_wo_pam.len();
    let rna = scaffold.substitute(&raw.sequence_wo_pam);
    let centroid = predictor.centroid(&rna, settings)?;

    let from = scaffold.slot_offset();
    let notation_binding_only = centroid
        .structure
        .get(from..from + target_len)
        .ok_or_else(|| DesignError::ToolOutput {
            executable: "structure predictor".to_string(),
            message: format!(
                "structure of length {} does not cover target at {from}..{}",
                centroid.structure.len(),
                from + target_len
            ),
        })?
        .to_string();
    let accessibility = unpaired_fraction(&notation_binding_only);
    debug!(
        "{} gc={:.2} accessibility={accessibility:.2} {notation_binding_only}",
        raw.sequence_wo_pam,
        gc_content(&raw.sequence_wo_pam)
    );

    Ok(ScoredSite {
        gc_content: gc_content(&raw.sequence_wo_pam),
        fold: FoldResult {
            notation: centroid.structure,
            notation_binding_only,
            accessibility,
        },
        raw,
    })
}

/// Min-max normalization, [`DEGENERATE_RANGE_FALLBACK`] if `min == max`.
pub fn normalize(value: f64, min: f64, max: f64) -> f64 {
    let range = max - min;
    if range == 0.0 {
        DEGENERATE_RANGE_FALLBACK
    } else {
        (value - min) / range
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    match values.minmax_by(|a, b| a.total_cmp(b)) {
        MinMaxResult::NoElements => (0.0, 0.0),
        MinMaxResult::OneElement(v) => (v, v),
        MinMaxResult::MinMax(min, max) => (min, max),
    }
}

/// Low GC and high accessibility rank first:
/// `(1 - norm(gc)) + norm(accessibility)` over the batch.
pub fn composite_scores(sites: &[ScoredSite]) -> Vec<f64> {
    let (gc_min, gc_max) = bounds(sites.iter().map(|s| s.gc_content));
    let (acc_min, acc_max) = bounds(sites.iter().map(|s| s.fold.accessibility));
    sites
        .iter()
        .map(|s| {
            (1.0 - normalize(s.gc_content, gc_min, gc_max))
                + normalize(s.fold.accessibility, acc_min, acc_max)
        })
        .collect()
}

pub fn finalize_batch(
    locus: &Locus,
    system: &RecognitionSystem,
    sites: Vec<ScoredSite>,
) -> Vec<Candidate> {
    let scores = composite_scores(&sites);
    sites
        .into_iter()
        .zip(scores)
        .map(|(site, composite_score)| Candidate {
            locus_id: locus.id,
            system_id: system.id,
            strand: site.raw.strand,
            position: site.raw.position,
            sequence: site.raw.sequence,
            sequence_wo_pam: site.raw.sequence_wo_pam,
            gc_content: site.gc_content,
            fold: site.fold,
            composite_score,
        })
        .collect()
}

/// Best composite score first; ties keep batch order.
pub fn rank_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.composite_score.total_cmp(&a.composite_score));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::Strand,
        rna_structure::{CentroidStructure, RnaStructureError},
    };

    /// Pairs the first `paired` bases of the target with the scaffold tail.
    struct StubPredictor {
        slot_offset: usize,
        paired: usize,
    }

    impl StructurePredictor for StubPredictor {
        fn centroid(
            &self,
            rna: &str,
            _settings: &FoldSettings,
        ) -> Result<CentroidStructure, RnaStructureError> {
            let mut structure = vec!['.'; rna.len()];
            for i in 0..self.paired {
                structure[self.slot_offset + i] = '(';
                structure[rna.len() - 1 - i] = ')';
            }
            Ok(CentroidStructure {
                structure: structure.into_iter().collect(),
                distance: 0.0,
            })
        }
    }

    fn raw(seq: &str) -> RawCandidate {
        RawCandidate {
            strand: Strand::Forward,
            position: 0,
            sequence: format!("{seq}TGG"),
            sequence_wo_pam: seq.to_string(),
        }
    }

    fn site(gc: f64, accessibility: f64) -> ScoredSite {
        ScoredSite {
            raw: raw("ACGT"),
            gc_content: gc,
            fold: FoldResult {
                notation: String::new(),
                notation_binding_only: String::new(),
                accessibility,
            },
        }
    }

    #[test]
    fn test_template_slot_offset() {
        let scaffold = ScaffoldTemplate::new("GG{target_sequence_without_pam}GUUUUAGA").unwrap();
        assert_eq!(scaffold.slot_offset(), 2);
        assert_eq!(scaffold.substitute("ACGU"), "GGACGUGUUUUAGA");
    }

    #[test]
    fn test_template_requires_exactly_one_slot() {
        assert!(ScaffoldTemplate::new("GUUUUAGA").is_err());
        assert!(ScaffoldTemplate::new(
            "{target_sequence_without_pam}GU{target_sequence_without_pam}"
        )
        .is_err());
    }

    #[test]
    fn test_score_site_slices_target_region() {
        let system = RecognitionSystem::cas9_ngg();
        let scaffold = ScaffoldTemplate::for_system(&system).unwrap();
        let predictor = StubPredictor {
            slot_offset: scaffold.slot_offset(),
            paired: 5,
        };
        let site = score_site(
            raw("GGGGGAAAAAAAAAACCCCC"),
            &scaffold,
            &predictor,
            &FoldSettings::default(),
        )
        .unwrap();
        assert_eq!(site.fold.notation_binding_only, "(((((...............");
        assert_eq!(site.fold.accessibility, 0.75);
        assert_eq!(site.gc_content, 0.5);
        assert!((0.0..=1.0).contains(&site.fold.accessibility));
    }

    #[test]
    fn test_short_structure_is_an_error() {
        struct Truncating;
        impl StructurePredictor for Truncating {
            fn centroid(
                &self,
                _rna: &str,
                _settings: &FoldSettings,
            ) -> Result<CentroidStructure, RnaStructureError> {
                Ok(CentroidStructure {
                    structure: "....".to_string(),
                    distance: 0.0,
                })
            }
        }
        let scaffold = ScaffoldTemplate::new("{target_sequence_without_pam}GUUU").unwrap();
        let err = score_site(
            raw(&"A".repeat(20)),
            &scaffold,
            &Truncating,
            &FoldSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DesignError::ToolOutput { .. }));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(0.5, 0.0, 1.0), 0.5);
        assert_eq!(normalize(0.3, 0.3, 0.3), DEGENERATE_RANGE_FALLBACK);
    }

    #[test]
    fn test_gc_extremes_get_full_and_zero_inverted_terms() {
        let sites = vec![site(0.3, 0.5), site(0.6, 0.5), site(0.45, 0.5)];
        let scores = composite_scores(&sites);
        // Accessibility is degenerate here, so only the GC term varies.
        assert_eq!(scores[0], 1.0);
        assert_eq!(scores[1], 0.0);
        assert!((scores[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_identical_gc_uses_fallback_without_nan() {
        let sites = vec![site(0.3, 0.2), site(0.3, 0.8)];
        let scores = composite_scores(&sites);
        assert!(scores.iter().all(|s| s.is_finite()));
        assert_eq!(scores, vec![1.0, 2.0]);
    }

    #[test]
    fn test_single_candidate_batch() {
        let scores = composite_scores(&[site(0.4, 0.4)]);
        assert_eq!(scores, vec![1.0]);
        assert!(composite_scores(&[]).is_empty());
    }

    #[test]
    fn test_rank_candidates_descending() {
        let locus = Locus {
            id: 3,
            orf: "YFG1".to_string(),
            symbol: None,
            strain: "S288C".to_string(),
            sequence: "A".repeat(10),
            start_orf: 0,
            end_orf: 10,
        };
        let system = RecognitionSystem::cas9_ngg();
        let sites = vec![site(0.6, 0.1), site(0.3, 0.9), site(0.45, 0.5)];
        let mut candidates = finalize_batch(&locus, &system, sites);
        rank_candidates(&mut candidates);
        let scores: Vec<f64> = candidates.iter().map(|c| c.composite_score).collect();
        assert_eq!(scores[0], 2.0);
        assert_eq!(scores[2], 0.0);
        assert!(candidates.iter().all(|c| c.locus_id == 3 && c.system_id == 1));
    }
}
