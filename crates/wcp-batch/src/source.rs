//! Trace sources: where the batch runner gets its recordings from

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wcp_core::{CellId, Trace, TrialId, TrialKey, WcpError, WcpResult};
use wcp_processing::CellTypes;

/// Data collaborator consumed by the batch runner and the aggregators
pub trait TraceSource: Send + Sync {
    /// Load one trial. Missing or unreadable data is `TraceNotFound`.
    fn load_trace(&self, cell: CellId, trial: TrialId) -> WcpResult<Trace>;

    /// Trials recorded with `protocol`, in analysis order. Calling it again
    /// restarts the sequence.
    fn iterate_trials(&self, protocol: &str) -> Vec<TrialKey>;

    /// Cells chosen for analysis
    fn selected_cells(&self) -> BTreeSet<CellId>;

    /// Cell type labels
    fn assigned_types(&self) -> CellTypes;

    /// Known protocol names
    fn protocols(&self) -> Vec<String>;
}

fn not_found(cell: CellId, trial: TrialId, reason: impl Into<String>) -> WcpError {
    WcpError::TraceNotFound {
        cell,
        trial,
        reason: reason.into(),
    }
}

/// Traces held in memory, for tests and generated data
#[derive(Debug, Clone, Default)]
pub struct InMemoryTraceSource {
    traces: BTreeMap<TrialKey, Trace>,
    protocols: BTreeMap<String, Vec<TrialKey>>,
    selected: Option<BTreeSet<CellId>>,
    types: CellTypes,
}

impl InMemoryTraceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trial to a protocol. A trial added twice keeps the newest trace.
    pub fn insert(&mut self, protocol: &str, key: TrialKey, trace: Trace) {
        self.traces.insert(key, trace);
        let trials = self.protocols.entry(protocol.to_string()).or_default();
        if !trials.contains(&key) {
            trials.push(key);
        }
    }

    /// Register a trial in a protocol without data, so loading it fails
    pub fn insert_missing(&mut self, protocol: &str, key: TrialKey) {
        self.protocols.entry(protocol.to_string()).or_default().push(key);
    }

    /// Restrict analysis to `cells`. Without a selection every cell is selected.
    pub fn select_cells(&mut self, cells: impl IntoIterator<Item = CellId>) {
        self.selected = Some(cells.into_iter().collect());
    }

    pub fn assign_type(&mut self, cell: CellId, cell_type: impl Into<String>) {
        self.types.insert(cell, cell_type.into());
    }
}

impl TraceSource for InMemoryTraceSource {
    fn load_trace(&self, cell: CellId, trial: TrialId) -> WcpResult<Trace> {
        self.traces
            .get(&TrialKey::new(cell, trial))
            .cloned()
            .ok_or_else(|| not_found(cell, trial, "no trace in memory"))
    }

    fn iterate_trials(&self, protocol: &str) -> Vec<TrialKey> {
        self.protocols.get(protocol).cloned().unwrap_or_default()
    }

    fn selected_cells(&self) -> BTreeSet<CellId> {
        match &self.selected {
            Some(cells) => cells.clone(),
            None => self
                .protocols
                .values()
                .flatten()
                .map(|k| k.cell)
                .collect(),
        }
    }

    fn assigned_types(&self) -> CellTypes {
        self.types.clone()
    }

    fn protocols(&self) -> Vec<String> {
        self.protocols.keys().cloned().collect()
    }
}

/// File naming of per-trial recordings: `<prefix><link><cell><link><trial><suffix>`
/// with cell and trial zero-padded to `pad` digits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNameFormat {
    pub prefix: String,
    pub pad: usize,
    pub link: String,
    pub suffix: String,
}

impl Default for FileNameFormat {
    fn default() -> Self {
        Self {
            prefix: "Cell".to_string(),
            pad: 4,
            link: "_".to_string(),
            suffix: ".json".to_string(),
        }
    }
}

impl FileNameFormat {
    pub fn file_name(&self, cell: CellId, trial: TrialId) -> String {
        format!(
            "{prefix}{link}{cell:0pad$}{link}{trial:0pad$}{suffix}",
            prefix = self.prefix,
            link = self.link,
            suffix = self.suffix,
            pad = self.pad,
        )
    }
}

/// Project description stored next to the trace files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectManifest {
    pub name: String,
    pub file_format: FileNameFormat,
    /// Trials of each protocol, in analysis order
    pub protocols: BTreeMap<String, Vec<TrialKey>>,
    /// Cells chosen for analysis; every listed cell when absent
    pub selected_cells: Option<Vec<CellId>>,
    pub cell_types: CellTypes,
}

impl ProjectManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_trial(&mut self, protocol: &str, key: TrialKey) {
        let trials = self.protocols.entry(protocol.to_string()).or_default();
        if !trials.contains(&key) {
            trials.push(key);
        }
    }
}

/// Recordings stored as one JSON trace per trial plus a JSON manifest
#[derive(Debug, Clone)]
pub struct DirectoryTraceSource {
    root: PathBuf,
    manifest: ProjectManifest,
}

impl DirectoryTraceSource {
    /// Name of the manifest file inside the project directory
    pub const MANIFEST: &'static str = "project.json";

    /// Open an existing project directory
    pub fn open(root: impl AsRef<Path>) -> WcpResult<Self> {
        let root = root.as_ref().to_path_buf();
        let text = fs::read_to_string(root.join(Self::MANIFEST))?;
        let manifest: ProjectManifest =
            serde_json::from_str(&text).map_err(|e| WcpError::Serialization {
                reason: format!("manifest {}: {}", root.display(), e),
            })?;
        info!(
            project = %manifest.name,
            protocols = manifest.protocols.len(),
            "opened project directory"
        );
        Ok(Self { root, manifest })
    }

    /// Create the directory and write the manifest
    pub fn create(root: impl AsRef<Path>, manifest: ProjectManifest) -> WcpResult<Self> {
        let source = Self {
            root: root.as_ref().to_path_buf(),
            manifest,
        };
        fs::create_dir_all(&source.root)?;
        source.save_manifest()?;
        Ok(source)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &ProjectManifest {
        &self.manifest
    }

    pub fn trace_path(&self, cell: CellId, trial: TrialId) -> PathBuf {
        self.root.join(self.manifest.file_format.file_name(cell, trial))
    }

    pub fn save_manifest(&self) -> WcpResult<()> {
        let json = serde_json::to_string_pretty(&self.manifest).map_err(|e| {
            WcpError::Serialization {
                reason: e.to_string(),
            }
        })?;
        fs::write(self.root.join(Self::MANIFEST), json)?;
        Ok(())
    }

    /// Write one trial and register it under `protocol`
    pub fn write_trace(&mut self, protocol: &str, key: TrialKey, trace: &Trace) -> WcpResult<()> {
        let path = self.trace_path(key.cell, key.trial);
        let json = serde_json::to_string(trace).map_err(|e| WcpError::Serialization {
            reason: e.to_string(),
        })?;
        fs::write(&path, json)?;
        debug!(path = %path.display(), "wrote trace");
        self.manifest.add_trial(protocol, key);
        self.save_manifest()
    }
}

impl TraceSource for DirectoryTraceSource {
    fn load_trace(&self, cell: CellId, trial: TrialId) -> WcpResult<Trace> {
        let path = self.trace_path(cell, trial);
        let text = fs::read_to_string(&path)
            .map_err(|e| not_found(cell, trial, format!("{}: {}", path.display(), e)))?;
        let trace: Trace = serde_json::from_str(&text)
            .map_err(|e| not_found(cell, trial, format!("{}: {}", path.display(), e)))?;
        trace.validate()?;
        Ok(trace)
    }

    fn iterate_trials(&self, protocol: &str) -> Vec<TrialKey> {
        self.manifest.protocols.get(protocol).cloned().unwrap_or_default()
    }

    fn selected_cells(&self) -> BTreeSet<CellId> {
        match &self.manifest.selected_cells {
            Some(cells) => cells.iter().copied().collect(),
            None => self
                .manifest
                .protocols
                .values()
                .flatten()
                .map(|k| k.cell)
                .collect(),
        }
    }

    fn assigned_types(&self) -> CellTypes {
        self.manifest.cell_types.clone()
    }

    fn protocols(&self) -> Vec<String> {
        self.manifest.protocols.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wcp_core::Stimulus;

    fn trace() -> Trace {
        Trace::new(vec![0.0, 1.0, 2.0, 3.0], 1000.0)
            .unwrap()
            .with_stimulus(Stimulus::new(0.001, 0.002, 1e-10))
    }

    #[test]
    fn test_file_name_format() {
        let format = FileNameFormat::default();
        assert_eq!(format.file_name(3, 12), "Cell_0003_0012.json");

        let short = FileNameFormat {
            prefix: "c".into(),
            pad: 2,
            link: "-".into(),
            suffix: ".ibw".into(),
        };
        assert_eq!(short.file_name(7, 100), "c-07-100.ibw");
    }

    #[test]
    fn test_in_memory_source() {
        let mut source = InMemoryTraceSource::new();
        source.insert("step", TrialKey::new(1, 1), trace());
        source.insert("step", TrialKey::new(2, 1), trace());
        source.insert("step", TrialKey::new(1, 1), trace());

        assert_eq!(source.iterate_trials("step").len(), 2);
        assert!(source.iterate_trials("other").is_empty());
        assert_eq!(source.selected_cells().len(), 2);

        source.select_cells([2]);
        assert_eq!(source.selected_cells().into_iter().collect::<Vec<_>>(), vec![2]);

        let err = source.load_trace(9, 9).unwrap_err();
        assert!(err.aborts_batch());
    }

    #[test]
    fn test_directory_source_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = ProjectManifest::new("demo");
        manifest.cell_types.insert(1, "pyramidal".into());
        let mut source = DirectoryTraceSource::create(dir.path(), manifest).unwrap();
        source.write_trace("step", TrialKey::new(1, 2), &trace()).unwrap();

        assert!(dir.path().join("Cell_0001_0002.json").exists());

        let reopened = DirectoryTraceSource::open(dir.path()).unwrap();
        assert_eq!(reopened.iterate_trials("step"), vec![TrialKey::new(1, 2)]);
        assert_eq!(reopened.assigned_types().get(&1).map(String::as_str), Some("pyramidal"));
        let loaded = reopened.load_trace(1, 2).unwrap();
        assert_eq!(loaded.samples(), trace().samples());
        assert_eq!(loaded.stimulus(), trace().stimulus());
    }

    #[test]
    fn test_directory_missing_trace() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryTraceSource::create(dir.path(), ProjectManifest::new("empty")).unwrap();
        match source.load_trace(4, 5) {
            Err(WcpError::TraceNotFound { cell, trial, .. }) => assert_eq!((cell, trial), (4, 5)),
            other => panic!("expected TraceNotFound, got {:?}", other),
        }
    }
}
