use crate::{
    config::DesignConfig,
    error::{DesignError, Result},
    genome_index::{DirectoryGenomeIndex, GenomeIndexLocator},
    model::{Candidate, DiagnosticPrimerPair, LocusId, SystemId},
    off_target::{Aligner, AlignerParams, Bowtie, filter_off_targets},
    oligo::{BuildOligo, build_oligos},
    primer_design::{Primer3, PrimerDesigner, design_diagnostic_primers},
    rna_structure::{FoldSettings, RnaFold, StructurePredictor},
    scanner::SiteScanner,
    scoring::{ScaffoldTemplate, finalize_batch, rank_candidates, score_site},
    store::CandidateStore,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError, mpsc},
    thread::{self, JoinHandle},
};

/// One mutex per key, created on first use and dropped once nobody holds or
/// waits for it.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Runs `f` while holding the lock of `key`.
    pub fn with_lock<T>(&self, key: K, f: impl FnOnce() -> T) -> T {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        let value = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only taken under the map lock: the map and `lock` are the
        // last two owners.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
        value
    }
}

pub type PairLocks = KeyedLocks<(LocusId, SystemId)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPhase {
    Cached,
    Scanning,
    Filtering,
    Folding,
    Storing,
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cached => "cached",
            Self::Scanning => "scanning",
            Self::Filtering => "filtering",
            Self::Folding => "folding",
            Self::Storing => "storing",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchProgress {
    pub locus_id: LocusId,
    pub system_id: SystemId,
    pub phase: SearchPhase,
    pub done: usize,
    pub total: usize,
}

/// Shared handle on the store and the external tools.
#[derive(Clone)]
pub struct DesignContext {
    pub store: Arc<dyn CandidateStore>,
    pub genomes: Arc<dyn GenomeIndexLocator>,
    pub aligner: Arc<dyn Aligner>,
    pub predictor: Arc<dyn StructurePredictor>,
    pub primer_designer: Arc<dyn PrimerDesigner>,
    pub aligner_params: AlignerParams,
    pub fold_settings: FoldSettings,
    pair_locks: Arc<PairLocks>,
    primer_locks: Arc<KeyedLocks<LocusId>>,
}

impl DesignContext {
    pub fn new(
        store: Arc<dyn CandidateStore>,
        genomes: Arc<dyn GenomeIndexLocator>,
        aligner: Arc<dyn Aligner>,
        predictor: Arc<dyn StructurePredictor>,
        primer_designer: Arc<dyn PrimerDesigner>,
    ) -> Self {
        Self {
            store,
            genomes,
            aligner,
            predictor,
            primer_designer,
            aligner_params: AlignerParams::default(),
            fold_settings: FoldSettings::default(),
            pair_locks: Arc::new(PairLocks::default()),
            primer_locks: Arc::new(KeyedLocks::default()),
        }
    }

    /// bowtie, RNAfold and primer3 as configured.
    pub fn from_config(config: &DesignConfig, store: Arc<dyn CandidateStore>) -> Self {
        let mut ctx = Self::new(
            store,
            Arc::new(DirectoryGenomeIndex::new(&config.genomes_dir)),
            Arc::new(Bowtie::new(&config.aligner_bin)),
            Arc::new(RnaFold::new(&config.rnafold_bin)),
            Arc::new(Primer3::new(&config.primer3_bin)),
        );
        ctx.aligner_params = AlignerParams {
            max_alignments: config.max_alignments,
            max_mismatches: config.max_mismatches,
        };
        ctx.fold_settings.temperature = config.fold_temperature;
        ctx
    }
}

/// Scored, ranked candidates of a (locus, system) pair. A stored non-empty
/// batch is returned as is; otherwise the batch is computed and stored. At most
/// one computation per pair runs at a time.
pub fn search_candidates(
    ctx: &DesignContext,
    locus_id: LocusId,
    system_id: SystemId,
    on_progress: &mut dyn FnMut(SearchProgress),
) -> Result<Vec<Candidate>> {
    let mut report = |phase: SearchPhase, done: usize, total: usize| {
        on_progress(SearchProgress {
            locus_id,
            system_id,
            phase,
            done,
            total,
        })
    };

    ctx.pair_locks.with_lock((locus_id, system_id), || {
        search_unlocked(ctx, locus_id, system_id, &mut report)
    })
}

fn search_unlocked(
    ctx: &DesignContext,
    locus_id: LocusId,
    system_id: SystemId,
    report: &mut dyn FnMut(SearchPhase, usize, usize),
) -> Result<Vec<Candidate>> {
    let stored = ctx.store.get_candidates(locus_id, system_id)?;
    if !stored.is_empty() {
        report(SearchPhase::Cached, stored.len(), stored.len());
        return Ok(stored);
    }

    let locus = ctx.store.locus(locus_id)?;
    let system = ctx.store.system(system_id)?;
    locus.validate()?;
    let policy = system.filter_policy()?;
    let scanner = SiteScanner::new(&system.recognition_pattern)?;
    let scaffold = ScaffoldTemplate::for_system(&system)?;
    info!(
        "Searching {} for {} targets",
        locus.display_name(),
        system.name
    );

    report(SearchPhase::Scanning, 0, 1);
    let raw = scanner.scan_locus(&locus);
    report(SearchPhase::Scanning, 1, 1);

    report(SearchPhase::Filtering, 0, raw.len());
    let unique = filter_off_targets(
        raw,
        policy,
        &locus,
        ctx.genomes.as_ref(),
        ctx.aligner.as_ref(),
        &ctx.aligner_params,
    )?;
    report(SearchPhase::Filtering, unique.len(), unique.len());

    let total = unique.len();
    let mut sites = Vec::with_capacity(total);
    for (done, candidate) in unique.into_iter().enumerate() {
        report(SearchPhase::Folding, done, total);
        sites.push(score_site(
            candidate,
            &scaffold,
            ctx.predictor.as_ref(),
            &ctx.fold_settings,
        )?);
    }
    report(SearchPhase::Folding, total, total);

    let mut candidates = finalize_batch(&locus, &system, sites);
    rank_candidates(&mut candidates);
    report(SearchPhase::Storing, 0, 1);
    let kept = ctx.store.store_candidates(locus_id, system_id, candidates)?;
    report(SearchPhase::Storing, 1, 1);
    info!(
        "{} candidates for {} with {}",
        kept.len(),
        locus.display_name(),
        system.name
    );
    Ok(kept)
}

/// A candidate search on its own thread.
pub struct SearchHandle {
    pub progress: mpsc::Receiver<SearchProgress>,
    worker: JoinHandle<Result<Vec<Candidate>>>,
}

impl SearchHandle {
    /// Waits for the batch. Progress not yet received is discarded.
    pub fn join(self) -> Result<Vec<Candidate>> {
        self.worker.join().map_err(|_| DesignError::WorkerLost)?
    }
}

/// Runs [`search_candidates`] in the background, streaming progress over a
/// channel. Dropping the handle detaches the worker; a running external tool
/// is not interrupted.
pub fn spawn_candidate_search(
    ctx: &DesignContext,
    locus_id: LocusId,
    system_id: SystemId,
) -> SearchHandle {
    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn({
        let ctx = ctx.clone();
        move || {
            search_candidates(&ctx, locus_id, system_id, &mut |progress| {
                // The receiver may be gone; the batch still completes.
                let _ = tx.send(progress);
            })
        }
    });
    SearchHandle {
        progress: rx,
        worker,
    }
}

/// Diagnostic primers of a locus, designed at most once at a time per locus.
pub fn diagnostic_primers(ctx: &DesignContext, locus_id: LocusId) -> Result<DiagnosticPrimerPair> {
    ctx.primer_locks.with_lock(locus_id, || {
        let locus = ctx.store.locus(locus_id)?;
        locus.validate()?;
        design_diagnostic_primers(&locus, ctx.store.as_ref(), ctx.primer_designer.as_ref())
    })
}

/// Build oligos for the `rank`-th best candidate of the pair.
pub fn oligos_for_candidate(
    ctx: &DesignContext,
    locus_id: LocusId,
    system_id: SystemId,
    method: &str,
    rank: usize,
) -> Result<Vec<BuildOligo>> {
    let candidates = search_candidates(ctx, locus_id, system_id, &mut |_| {})?;
    let Some(candidate) = candidates.get(rank) else {
        warn!("Locus {locus_id} has {} candidates, none at rank {rank}", candidates.len());
        return Ok(vec![]);
    };
    let locus = ctx.store.locus(locus_id)?;
    let system = ctx.store.system(system_id)?;
    build_oligos(&locus, &system, candidate, method)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimerTableRow {
    pub name: String,
    pub sequence: String,
}

/// Ordering table for the best candidate of each locus: build oligos, repair
/// oligos, then diagnostic primers (empty if none could be designed).
pub fn assemble_primer_table(
    ctx: &DesignContext,
    system_id: SystemId,
    method: &str,
    locus_ids: &[LocusId],
) -> Result<Vec<PrimerTableRow>> {
    let mut rows = vec![];
    for &locus_id in locus_ids {
        let locus = ctx.store.locus(locus_id)?;
        let name = locus.display_name().to_string();
        rows.extend(
            oligos_for_candidate(ctx, locus_id, system_id, method, 0)?
                .into_iter()
                .map(|oligo| PrimerTableRow {
                    name: oligo.primer_name,
                    sequence: oligo.primer_sequence,
                }),
        );
        let diagnostic = diagnostic_primers(ctx, locus_id)?;
        for (suffix, sequence) in [
            ("_repair oligo fw", locus.repair_oligo_fw()),
            ("_repair oligo rv", locus.repair_oligo_rv()),
            ("_dg fw", diagnostic.forward),
            ("_dg rv", diagnostic.reverse),
        ] {
            rows.push(PrimerTableRow {
                name: format!("{name}{suffix}"),
                sequence,
            });
        }
    }
    Ok(rows)
}

/// Tab-separated `name<TAB>sequence` lines without a header, as oligo
/// suppliers take them.
pub fn primer_table_tsv(rows: &[PrimerTableRow]) -> String {
    rows.iter()
        .map(|row| format!("{}\t{}\n", row.name, row.sequence))
        .collect()
}
