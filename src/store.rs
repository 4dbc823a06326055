use crate::{
    error::{DesignError, Result},
    model::{Candidate, DiagnosticPrimerPair, Locus, LocusId, RecognitionSystem, SystemId},
};
use fs2::FileExt;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};
use tempfile::NamedTempFile;

fn state_file_error(e: io::Error, action: &str, path: &Path) -> DesignError {
    DesignError::Io(io::Error::new(
        e.kind(),
        format!("Could not {action} state file '{}': {e}", path.display()),
    ))
}

/// State stored at `path`, `None` if there is no such file.
fn read_state_if_exists(path: &Path) -> Result<Option<ProjectState>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(state_file_error(e, "read", path)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateSet {
    pub locus_id: LocusId,
    pub system_id: SystemId,
    pub candidates: Vec<Candidate>,
}

/// Everything the designer persists: loci, recognition systems, finished
/// candidate batches and diagnostic primers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectState {
    #[serde(default)]
    pub loci: Vec<Locus>,
    #[serde(default)]
    pub systems: Vec<RecognitionSystem>,
    #[serde(default)]
    pub candidate_sets: Vec<CandidateSet>,
    #[serde(default)]
    pub diagnostic_primers: Vec<DiagnosticPrimerPair>,
}

impl ProjectState {
    /// A fresh state holding the Cas9 (NGG) system.
    pub fn seeded() -> Self {
        Self {
            systems: vec![RecognitionSystem::cas9_ngg()],
            ..Self::default()
        }
    }

    pub fn load_from_path(path: &str) -> Result<Self> {
        let text =
            fs::read_to_string(path).map_err(|e| state_file_error(e, "read", Path::new(path)))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes a temporary file next to `path` and renames it over `path`, so
    /// readers see either the old or the new state.
    pub fn save_to_path(&self, path: &str) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        let target = Path::new(path);
        let dir = target
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let write = || -> io::Result<()> {
            let mut tmp = NamedTempFile::new_in(dir)?;
            tmp.write_all(text.as_bytes())?;
            tmp.persist(target).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| state_file_error(e, "write", target))
    }

    /// Adds or replaces a locus by id.
    pub fn upsert_locus(&mut self, locus: Locus) -> Result<()> {
        locus.validate()?;
        match self.loci.iter_mut().find(|l| l.id == locus.id) {
            Some(existing) => *existing = locus,
            None => self.loci.push(locus),
        }
        Ok(())
    }

    pub fn upsert_system(&mut self, system: RecognitionSystem) {
        match self.systems.iter_mut().find(|s| s.id == system.id) {
            Some(existing) => *existing = system,
            None => self.systems.push(system),
        }
    }

    fn candidate_set(&self, locus_id: LocusId, system_id: SystemId) -> Option<&CandidateSet> {
        self.candidate_sets
            .iter()
            .find(|set| set.locus_id == locus_id && set.system_id == system_id)
    }

    /// Keeps an existing non-empty set, otherwise records `candidates`.
    /// Returns the set now on record.
    fn insert_candidates_if_absent(
        &mut self,
        locus_id: LocusId,
        system_id: SystemId,
        candidates: Vec<Candidate>,
    ) -> Vec<Candidate> {
        if let Some(existing) = self.candidate_set(locus_id, system_id)
            && !existing.candidates.is_empty()
        {
            return existing.candidates.clone();
        }
        self.candidate_sets
            .retain(|set| !(set.locus_id == locus_id && set.system_id == system_id));
        self.candidate_sets.push(CandidateSet {
            locus_id,
            system_id,
            candidates: candidates.clone(),
        });
        candidates
    }

    fn set_diagnostic_primers(&mut self, pair: DiagnosticPrimerPair) {
        match self
            .diagnostic_primers
            .iter_mut()
            .find(|p| p.locus_id == pair.locus_id)
        {
            Some(existing) => *existing = pair,
            None => self.diagnostic_primers.push(pair),
        }
    }
}

/// Persistence used by the pipeline.
pub trait CandidateStore: Send + Sync {
    fn locus(&self, id: LocusId) -> Result<Locus>;
    fn system(&self, id: SystemId) -> Result<RecognitionSystem>;
    fn loci(&self) -> Result<Vec<Locus>>;
    fn systems(&self) -> Result<Vec<RecognitionSystem>>;

    /// Stored batch for the pair, empty if none was stored.
    fn get_candidates(&self, locus_id: LocusId, system_id: SystemId) -> Result<Vec<Candidate>>;

    /// Compare-and-insert: a non-empty batch already on record wins and is
    /// returned instead of `candidates`.
    fn store_candidates(
        &self,
        locus_id: LocusId,
        system_id: SystemId,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>>;

    fn get_diagnostic_primers(&self, locus_id: LocusId) -> Result<Option<DiagnosticPrimerPair>>;
    fn set_diagnostic_primers(&self, pair: DiagnosticPrimerPair) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<ProjectState>,
}

impl MemoryStore {
    pub fn new(state: ProjectState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn snapshot(&self) -> ProjectState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn read<T>(&self, f: impl FnOnce(&ProjectState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut ProjectState) -> T) -> T {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }
}

impl CandidateStore for MemoryStore {
    fn locus(&self, id: LocusId) -> Result<Locus> {
        self.read(|s| s.loci.iter().find(|l| l.id == id).cloned())
            .ok_or(DesignError::UnknownLocus(id))
    }

    fn system(&self, id: SystemId) -> Result<RecognitionSystem> {
        self.read(|s| s.systems.iter().find(|sys| sys.id == id).cloned())
            .ok_or(DesignError::UnknownSystem(id))
    }

    fn loci(&self) -> Result<Vec<Locus>> {
        Ok(self.read(|s| s.loci.clone()))
    }

    fn systems(&self) -> Result<Vec<RecognitionSystem>> {
        Ok(self.read(|s| s.systems.clone()))
    }

    fn get_candidates(&self, locus_id: LocusId, system_id: SystemId) -> Result<Vec<Candidate>> {
        Ok(self.read(|s| {
            s.candidate_set(locus_id, system_id)
                .map(|set| set.candidates.clone())
                .unwrap_or_default()
        }))
    }

    fn store_candidates(
        &self,
        locus_id: LocusId,
        system_id: SystemId,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>> {
        Ok(self.write(|s| s.insert_candidates_if_absent(locus_id, system_id, candidates)))
    }

    fn get_diagnostic_primers(&self, locus_id: LocusId) -> Result<Option<DiagnosticPrimerPair>> {
        Ok(self.read(|s| {
            s.diagnostic_primers
                .iter()
                .find(|p| p.locus_id == locus_id)
                .cloned()
        }))
    }

    fn set_diagnostic_primers(&self, pair: DiagnosticPrimerPair) -> Result<()> {
        self.write(|s| s.set_diagnostic_primers(pair));
        Ok(())
    }
}

/// JSON state file that several processes may share.
///
/// Every change takes an exclusive lock on `<path>.lock`, reloads the file,
/// applies the change and replaces the file. The in-memory copy only takes the
/// new state once it is on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    /// Opens `path`, starting from a seeded state if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = read_state_if_exists(&path)?.unwrap_or_else(ProjectState::seeded);
        Ok(Self {
            path,
            inner: MemoryStore::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> ProjectState {
        self.inner.snapshot()
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Picks up changes saved by other stores on the same file.
    fn refresh(&self) -> Result<()> {
        if let Some(state) = read_state_if_exists(&self.path)? {
            self.inner.write(|s| *s = state);
        }
        Ok(())
    }

    /// Applies `f` to the latest saved state and saves the result. Nothing
    /// changes, in memory or on disk, if `f` or the save fails.
    pub fn update<T>(&self, f: impl FnOnce(&mut ProjectState) -> Result<T>) -> Result<T> {
        let mut current = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let lock_path = self.lock_path();
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| state_file_error(e, "lock", &lock_path))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| state_file_error(e, "lock", &lock_path))?;

        let mut next = read_state_if_exists(&self.path)?.unwrap_or_else(|| current.clone());
        let value = f(&mut next)?;
        next.save_to_path(&self.path.to_string_lossy())?;
        *current = next;
        debug!("Saved state to '{}'", self.path.display());
        Ok(value)
    }
}

impl CandidateStore for JsonFileStore {
    fn locus(&self, id: LocusId) -> Result<Locus> {
        self.inner.locus(id)
    }

    fn system(&self, id: SystemId) -> Result<RecognitionSystem> {
        self.inner.system(id)
    }

    fn loci(&self) -> Result<Vec<Locus>> {
        self.inner.loci()
    }

    fn systems(&self) -> Result<Vec<RecognitionSystem>> {
        self.inner.systems()
    }

    fn get_candidates(&self, locus_id: LocusId, system_id: SystemId) -> Result<Vec<Candidate>> {
        self.refresh()?;
        self.inner.get_candidates(locus_id, system_id)
    }

    fn store_candidates(
        &self,
        locus_id: LocusId,
        system_id: SystemId,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>> {
        self.update(|s| Ok(s.insert_candidates_if_absent(locus_id, system_id, candidates)))
    }

    fn get_diagnostic_primers(&self, locus_id: LocusId) -> Result<Option<DiagnosticPrimerPair>> {
        self.refresh()?;
        self.inner.get_diagnostic_primers(locus_id)
    }

    fn set_diagnostic_primers(&self, pair: DiagnosticPrimerPair) -> Result<()> {
        self.update(|s| {
            s.set_diagnostic_primers(pair);
            Ok(())
        })
    }
}
