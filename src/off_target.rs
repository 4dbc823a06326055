//! Off-target screening of raw candidates against a strain genome.
//!
//! Every candidate is expanded into eight reads, its PAM-free target followed
//! by each of `AGG, AAG, TGG, TAG, GGG, GAG, CGG, CAG`. The reads are aligned to
//! the strain index and a candidate is dropped when its reads together hit two
//! or more distinct genome positions.

use crate::{
    config::BOWTIE_ENV_BIN,
    error::{DesignError, Result},
    genome_index::GenomeIndexLocator,
    model::{FilterPolicy, Locus},
    scanner::RawCandidate,
};
use bio::io::fasta;
use log::{debug, info, warn};
use std::{
    collections::{BTreeMap, HashSet},
    io::ErrorKind,
    path::Path,
    process::Command,
};

pub const VARIANT_BASES: [char; 4] = ['A', 'T', 'G', 'C'];
pub const VARIANT_PAMS: [&str; 2] = ["GG", "AG"];
pub const VARIANTS_PER_CANDIDATE: usize = VARIANT_BASES.len() * VARIANT_PAMS.len();

/// Candidates whose variants hit at least this many positions are dropped.
pub const OFF_TARGET_HIT_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignerParams {
    pub max_alignments: u32,
    pub max_mismatches: u32,
}

impl Default for AlignerParams {
    fn default() -> Self {
        Self {
            max_alignments: 2,
            max_mismatches: 3,
        }
    }
}

/// One reported alignment of a variant read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentHit {
    pub read_id: String,
    pub reference: String,
    pub offset: u64,
}

pub trait Aligner: Send + Sync {
    fn align(
        &self,
        reads_fasta: &Path,
        index: &Path,
        params: &AlignerParams,
    ) -> Result<Vec<AlignmentHit>>;
}

/// Eight PAM variants of a target, index `2 * b + p` for base `b` and PAM tail `p`.
pub fn pam_variants(sequence_wo_pam: &str) -> Vec<String> {
    VARIANT_BASES
        .iter()
        .flat_map(|base| {
            VARIANT_PAMS
                .iter()
                .map(move |tail| format!("{sequence_wo_pam}{base}{tail}"))
        })
        .collect()
}

pub fn variant_read_id(candidate_index: usize, variant_index: usize) -> String {
    format!("target_{candidate_index}_{variant_index}")
}

/// Candidate index encoded in a read id produced by [`variant_read_id`].
pub fn candidate_index_of(read_id: &str) -> Option<usize> {
    let mut parts = read_id.strip_prefix("target_")?.split('_');
    let index = parts.next()?.parse().ok()?;
    let variant: usize = parts.next()?.parse().ok()?;
    (variant < VARIANTS_PER_CANDIDATE && parts.next().is_none()).then_some(index)
}

pub fn write_variants_fasta<W: std::io::Write>(
    candidates: &[RawCandidate],
    writer: W,
) -> Result<()> {
    let mut writer = fasta::Writer::new(writer);
    for (index, candidate) in candidates.iter().enumerate() {
        for (variant_index, variant) in pam_variants(&candidate.sequence_wo_pam).iter().enumerate()
        {
            writer.write(
                &variant_read_id(index, variant_index),
                None,
                variant.as_bytes(),
            )?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Distinct genome positions hit per candidate index.
pub fn hit_counts(hits: &[AlignmentHit]) -> BTreeMap<usize, usize> {
    let mut positions: BTreeMap<usize, HashSet<(&str, u64)>> = BTreeMap::new();
    for hit in hits {
        match candidate_index_of(&hit.read_id) {
            Some(index) => {
                positions
                    .entry(index)
                    .or_default()
                    .insert((hit.reference.as_str(), hit.offset));
            }
            None => warn!("Ignoring alignment of unexpected read '{}'", hit.read_id),
        }
    }
    positions
        .into_iter()
        .map(|(index, set)| (index, set.len()))
        .collect()
}

pub fn retain_unique(candidates: Vec<RawCandidate>, hits: &[AlignmentHit]) -> Vec<RawCandidate> {
    let counts = hit_counts(hits);
    candidates
        .into_iter()
        .enumerate()
        .filter(|(index, candidate)| {
            let count = counts.get(index).copied().unwrap_or(0);
            if count >= OFF_TARGET_HIT_THRESHOLD {
                debug!(
                    "Dropping {} ({count} genome positions)",
                    candidate.sequence
                );
                false
            } else {
                true
            }
        })
        .map(|(_, candidate)| candidate)
        .collect()
}

/// Applies the system's filter policy. An aligner failure fails the whole batch.
pub fn filter_off_targets(
    candidates: Vec<RawCandidate>,
    policy: FilterPolicy,
    locus: &Locus,
    genomes: &dyn GenomeIndexLocator,
    aligner: &dyn Aligner,
    params: &AlignerParams,
) -> Result<Vec<RawCandidate>> {
    if policy == FilterPolicy::None || candidates.is_empty() {
        return Ok(candidates);
    }
    let index = genomes.index_for_strain(&locus.strain)?;
    let mut reads = tempfile::Builder::new()
        .prefix("yeastriction-variants-")
        .suffix(".fa")
        .tempfile()?;
    write_variants_fasta(&candidates, reads.as_file_mut())?;

    info!(
        "Aligning {} variants of {} candidates for {} against '{}'",
        candidates.len() * VARIANTS_PER_CANDIDATE,
        candidates.len(),
        locus.display_name(),
        index.display()
    );
    let hits = aligner.align(reads.path(), &index, params)?;
    let before = candidates.len();
    let kept = retain_unique(candidates, &hits);
    info!(
        "Off-target filter kept {} of {before} candidates for {}",
        kept.len(),
        locus.display_name()
    );
    Ok(kept)
}

/// Bowtie 1 in FASTA mode, reporting read, strand, reference and offset.
#[derive(Debug, Clone)]
pub struct Bowtie {
    executable: String,
}

impl Bowtie {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.trim().to_string(),
        }
    }

    pub fn command_args(reads_fasta: &Path, index: &Path, params: &AlignerParams) -> Vec<String> {
        vec![
            "-k".to_string(),
            params.max_alignments.to_string(),
            "-v".to_string(),
            params.max_mismatches.to_string(),
            "--suppress".to_string(),
            "5,6,7,8".to_string(),
            "-f".to_string(),
            index.to_string_lossy().into_owned(),
            reads_fasta.to_string_lossy().into_owned(),
        ]
    }

    /// Parses `read<TAB>strand<TAB>reference<TAB>offset` lines.
    pub fn parse_hits(stdout: &str) -> Result<Vec<AlignmentHit>> {
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                let malformed = || DesignError::ToolOutput {
                    executable: "bowtie".to_string(),
                    message: format!("malformed alignment line '{line}'"),
                };
                if fields.len() < 4 {
                    return Err(malformed());
                }
                Ok(AlignmentHit {
                    read_id: fields[0].to_string(),
                    reference: fields[2].to_string(),
                    offset: fields[3].trim().parse().map_err(|_| malformed())?,
                })
            })
            .collect()
    }
}

impl Aligner for Bowtie {
    fn align(
        &self,
        reads_fasta: &Path,
        index: &Path,
        params: &AlignerParams,
    ) -> Result<Vec<AlignmentHit>> {
        let args = Self::command_args(reads_fasta, index, params);
        let output = Command::new(&self.executable)
            .args(&args)
            .output()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    DesignError::ToolNotFound {
                        executable: self.executable.clone(),
                        env_var: BOWTIE_ENV_BIN.to_string(),
                    }
                } else {
                    DesignError::Io(e)
                }
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            warn!("bowtie exited with {:?}: {}", output.status.code(), stderr.trim());
            return Err(DesignError::ToolFailed {
                executable: self.executable.clone(),
                args,
                status: output.status.code(),
                stdout,
                stderr,
            });
        }
        Self::parse_hits(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{genome_index::DirectoryGenomeIndex, model::Strand};
    use std::{fs, sync::Mutex};

    fn raw(seq_wo_pam: &str) -> RawCandidate {
        RawCandidate {
            strand: Strand::Forward,
            position: 0,
            sequence: format!("{seq_wo_pam}AGG"),
            sequence_wo_pam: seq_wo_pam.to_string(),
        }
    }

    fn locus() -> Locus {
        Locus {
            id: 1,
            orf: "YFG1".to_string(),
            symbol: None,
            strain: "S288C".to_string(),
            sequence: "ACGT".repeat(10),
            start_orf: 4,
            end_orf: 36,
        }
    }

    fn hit(read_id: &str, reference: &str, offset: u64) -> AlignmentHit {
        AlignmentHit {
            read_id: read_id.to_string(),
            reference: reference.to_string(),
            offset,
        }
    }

    /// Returns canned hits and records the reads it was given.
    struct FakeAligner {
        hits: Result<Vec<AlignmentHit>, String>,
        seen_reads: Mutex<Option<String>>,
    }

    impl FakeAligner {
        fn with_hits(hits: Vec<AlignmentHit>) -> Self {
            Self {
                hits: Ok(hits),
                seen_reads: Mutex::new(None),
            }
        }

        fn failing() -> Self {
            Self {
                hits: Err("index is corrupt".to_string()),
                seen_reads: Mutex::new(None),
            }
        }
    }

    impl Aligner for FakeAligner {
        fn align(
            &self,
            reads_fasta: &Path,
            _index: &Path,
            _params: &AlignerParams,
        ) -> Result<Vec<AlignmentHit>> {
            *self.seen_reads.lock().unwrap() = Some(fs::read_to_string(reads_fasta).unwrap());
            match &self.hits {
                Ok(hits) => Ok(hits.clone()),
                Err(stderr) => Err(DesignError::ToolFailed {
                    executable: "bowtie".to_string(),
                    args: vec![],
                    status: Some(1),
                    stdout: String::new(),
                    stderr: stderr.clone(),
                }),
            }
        }
    }

    #[test]
    fn test_pam_variants_are_fixed_and_ordered() {
        let variants = pam_variants("ACGT");
        assert_eq!(
            variants,
            vec![
                "ACGTAGG", "ACGTAAG", "ACGTTGG", "ACGTTAG", "ACGTGGG", "ACGTGAG", "ACGTCGG",
                "ACGTCAG"
            ]
        );
    }

    #[test]
    fn test_candidate_index_of() {
        assert_eq!(candidate_index_of("target_12_7"), Some(12));
        assert_eq!(candidate_index_of("target_3_8"), None);
        assert_eq!(candidate_index_of("target_x_1"), None);
        assert_eq!(candidate_index_of("chrI_1_1"), None);
    }

    #[test]
    fn test_variants_fasta_tags_every_read() {
        let mut out = Vec::new();
        write_variants_fasta(&[raw("AAAA"), raw("CCCC")], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches('>').count(), 16);
        assert!(text.starts_with(">target_0_0\nAAAAAGG\n"));
        assert!(text.contains(">target_1_7\nCCCCCAG\n"));
    }

    #[test]
    fn test_hit_counts_use_distinct_positions() {
        let hits = vec![
            hit("target_0_0", "chrI", 100),
            hit("target_0_1", "chrI", 100),
            hit("target_1_0", "chrI", 500),
            hit("target_1_4", "chrIV", 77),
        ];
        let counts = hit_counts(&hits);
        assert_eq!(counts.get(&0), Some(&1));
        assert_eq!(counts.get(&1), Some(&2));
    }

    #[test]
    fn test_filter_drops_multi_hit_candidates_only() {
        let candidates = vec![
            raw("AAAACCCCGGGGTTTTACGT"),
            raw("CCCCAAAAGGGGTTTTACGT"),
            raw("GGGGAAAACCCCTTTTACGT"),
        ];
        let aligner = FakeAligner::with_hits(vec![
            hit("target_0_0", "chrI", 10),
            hit("target_1_0", "chrI", 900),
            hit("target_1_3", "chrXV", 42),
        ]);
        let kept = filter_off_targets(
            candidates.clone(),
            FilterPolicy::Aligner,
            &locus(),
            &DirectoryGenomeIndex::unchecked("/genomes"),
            &aligner,
            &AlignerParams::default(),
        )
        .unwrap();
        assert_eq!(kept, vec![candidates[0].clone(), candidates[2].clone()]);
        let reads = aligner.seen_reads.lock().unwrap().clone().unwrap();
        assert_eq!(reads.matches('>').count(), 24);
    }

    #[test]
    fn test_aligner_failure_fails_the_batch() {
        let err = filter_off_targets(
            vec![raw("AAAACCCCGGGGTTTTACGT")],
            FilterPolicy::Aligner,
            &locus(),
            &DirectoryGenomeIndex::unchecked("/genomes"),
            &FakeAligner::failing(),
            &AlignerParams::default(),
        )
        .unwrap_err();
        assert!(err.is_tool_failure());
    }

    #[test]
    fn test_no_filter_policy_skips_aligner() {
        let candidates = vec![raw("AAAACCCCGGGGTTTTACGT")];
        let aligner = FakeAligner::failing();
        let kept = filter_off_targets(
            candidates.clone(),
            FilterPolicy::None,
            &locus(),
            &DirectoryGenomeIndex::unchecked("/genomes"),
            &aligner,
            &AlignerParams::default(),
        )
        .unwrap();
        assert_eq!(kept, candidates);
        assert!(aligner.seen_reads.lock().unwrap().is_none());
    }

    #[test]
    fn test_bowtie_args_and_output_parsing() {
        let args = Bowtie::command_args(
            Path::new("/tmp/reads.fa"),
            Path::new("/genomes/S288C"),
            &AlignerParams::default(),
        );
        assert_eq!(
            args,
            vec!["-k", "2", "-v", "3", "--suppress", "5,6,7,8", "-f", "/genomes/S288C", "/tmp/reads.fa"]
        );
        let hits = Bowtie::parse_hits("target_0_1\t+\tchrI\t1234\ntarget_0_1\t-\tchrII\t99\n\n").unwrap();
        assert_eq!(hits, vec![hit("target_0_1", "chrI", 1234), hit("target_0_1", "chrII", 99)]);
        assert!(Bowtie::parse_hits("target_0_1\t+\tchrI\n").is_err());
    }

    #[test]
    fn test_missing_bowtie_is_reported() {
        let err = Bowtie::new("yeastriction-test-no-such-bowtie")
            .align(Path::new("/tmp/none.fa"), Path::new("/tmp/none"), &AlignerParams::default())
            .unwrap_err();
        assert!(matches!(err, DesignError::ToolNotFound { .. }));
    }
}
