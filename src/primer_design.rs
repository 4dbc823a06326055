use crate::{
    config::PRIMER3_ENV_BIN,
    error::{DesignError, Result},
    model::{DiagnosticPrimerPair, Locus},
    sequence_utils::is_unambiguous_dna,
    store::CandidateStore,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{ErrorKind, Write},
    process::{Command, Stdio},
};

/// Minimum flank on each side of the coding region.
pub const MIN_FLANK_LEN: usize = 85;
/// Bases removed beyond each end of the coding region in the knockout template.
pub const KNOCKOUT_PAD: usize = 60;
/// The knockout template must be longer than this.
pub const MIN_TEMPLATE_LEN: usize = 50;
pub const PRODUCT_SIZE_RANGE: (usize, usize) = (250, 750);

pub const LEFT_PRIMER_KEY: &str = "PRIMER_LEFT_0_SEQUENCE";
pub const RIGHT_PRIMER_KEY: &str = "PRIMER_RIGHT_0_SEQUENCE";
const ERROR_KEY: &str = "PRIMER_ERROR";

/// Left and right windows, as `(start, length)`, that primers of a pair must fall in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairOkRegion {
    pub left: (usize, usize),
    pub right: (usize, usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimerDesignRequest {
    pub sequence_id: String,
    pub template: String,
    pub ok_regions: Vec<PairOkRegion>,
    pub product_size_range: (usize, usize),
    pub num_return: usize,
    pub gc_clamp: usize,
}

impl PrimerDesignRequest {
    /// primer3 Boulder-IO record, terminated by `=`.
    pub fn to_boulder_io(&self) -> String {
        let ok_regions = self
            .ok_regions
            .iter()
            .map(|r| format!("{},{},{},{}", r.left.0, r.left.1, r.right.0, r.right.1))
            .collect::<Vec<_>>()
            .join(" ; ");
        let mut record = String::new();
        for (key, value) in [
            ("SEQUENCE_ID", self.sequence_id.clone()),
            ("SEQUENCE_TEMPLATE", self.template.clone()),
            ("SEQUENCE_PRIMER_PAIR_OK_REGION_LIST", ok_regions),
            ("PRIMER_TASK", "generic".to_string()),
            ("PRIMER_PICK_LEFT_PRIMER", "1".to_string()),
            ("PRIMER_PICK_INTERNAL_OLIGO", "0".to_string()),
            ("PRIMER_PICK_RIGHT_PRIMER", "1".to_string()),
            ("PRIMER_NUM_RETURN", self.num_return.to_string()),
            (
                "PRIMER_PRODUCT_SIZE_RANGE",
                format!("{}-{}", self.product_size_range.0, self.product_size_range.1),
            ),
            ("PRIMER_GC_CLAMP", self.gc_clamp.to_string()),
        ] {
            record.push_str(&format!("{key}={value}\n"));
        }
        record.push_str("=\n");
        record
    }
}

/// Named output fields of a primer design run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimerDesignOutput {
    pub fields: BTreeMap<String, String>,
}

impl PrimerDesignOutput {
    /// Absent fields read as the empty string.
    pub fn field(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }
}

pub trait PrimerDesigner: Send + Sync {
    fn design(&self, request: &PrimerDesignRequest) -> Result<PrimerDesignOutput>;
}

/// Template with the coding region and [`KNOCKOUT_PAD`] bases on both sides
/// removed, or `None` if the locus does not allow a diagnostic PCR.
pub fn knockout_request(locus: &Locus) -> Option<PrimerDesignRequest> {
    if locus.upstream_flank_len() < MIN_FLANK_LEN || locus.downstream_flank_len() < MIN_FLANK_LEN
    {
        debug!("{}: flanks too short for diagnostic primers", locus.display_name());
        return None;
    }
    let cut_start = locus.start_orf - KNOCKOUT_PAD;
    let cut_end = locus.end_orf + KNOCKOUT_PAD;
    let template = format!(
        "{}{}",
        locus.sequence.get(..cut_start)?,
        locus.sequence.get(cut_end..)?
    );
    if template.len() <= MIN_TEMPLATE_LEN || !is_unambiguous_dna(&template) {
        debug!(
            "{}: knockout template unusable ({} bp)",
            locus.display_name(),
            template.len()
        );
        return None;
    }
    let right_start = locus.start_orf + KNOCKOUT_PAD;
    let right_len = template.len().checked_sub(right_start).filter(|&n| n > 0)?;
    Some(PrimerDesignRequest {
        sequence_id: locus.display_name().to_string(),
        template,
        ok_regions: vec![PairOkRegion {
            left: (0, cut_start),
            right: (right_start, right_len),
        }],
        product_size_range: PRODUCT_SIZE_RANGE,
        num_return: 1,
        gc_clamp: 1,
    })
}

/// Stored pair if complete; otherwise a fresh design, stored only when both
/// primers were found.
pub fn design_diagnostic_primers(
    locus: &Locus,
    store: &dyn CandidateStore,
    designer: &dyn PrimerDesigner,
) -> Result<DiagnosticPrimerPair> {
    if let Some(pair) = store.get_diagnostic_primers(locus.id)?
        && pair.is_complete()
    {
        debug!("{}: reusing stored diagnostic primers", locus.display_name());
        return Ok(pair);
    }
    let Some(request) = knockout_request(locus) else {
        return Ok(DiagnosticPrimerPair::empty(locus.id));
    };
    let output = designer.design(&request)?;
    let pair = DiagnosticPrimerPair {
        locus_id: locus.id,
        forward: output.field(LEFT_PRIMER_KEY).to_string(),
        reverse: output.field(RIGHT_PRIMER_KEY).to_string(),
    };
    if pair.is_complete() {
        info!("{}: diagnostic primers found", locus.display_name());
        store.set_diagnostic_primers(pair.clone())?;
        Ok(pair)
    } else {
        warn!("{}: no diagnostic primer pair found", locus.display_name());
        Ok(DiagnosticPrimerPair::empty(locus.id))
    }
}

/// `primer3_core`, fed one Boulder-IO record on stdin.
#[derive(Debug, Clone)]
pub struct Primer3 {
    executable: String,
}

impl Primer3 {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.trim().to_string(),
        }
    }

    pub fn parse_boulder_io(stdout: &str) -> PrimerDesignOutput {
        let fields = stdout
            .lines()
            .take_while(|line| line.trim() != "=")
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
        PrimerDesignOutput { fields }
    }
}

impl PrimerDesigner for Primer3 {
    fn design(&self, request: &PrimerDesignRequest) -> Result<PrimerDesignOutput> {
        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    DesignError::ToolNotFound {
                        executable: self.executable.clone(),
                        env_var: PRIMER3_ENV_BIN.to_string(),
                    }
                } else {
                    DesignError::Io(e)
                }
            })?;
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(request.to_boulder_io().as_bytes()),
            None => Ok(()),
        };
        // Reap the child before reporting a failed write.
        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let parsed = Self::parse_boulder_io(&stdout);
        if !output.status.success() || !parsed.field(ERROR_KEY).is_empty() {
            warn!(
                "primer3 failed for {}: {}",
                request.sequence_id,
                parsed.field(ERROR_KEY)
            );
            return Err(DesignError::ToolFailed {
                executable: self.executable.clone(),
                args: vec![],
                status: output.status.code(),
                stdout,
                stderr,
            });
        }
        written?;
        Ok(parsed)
    }
}
