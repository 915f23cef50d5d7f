//! Result tables of finished runs and their CSV / JSON export

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wcp_core::{Columns, MembraneTable, MiniTable, ResultTable, SpikeTable, WcpError, WcpResult};

/// Analysis that produced a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnalysisKind {
    Spike,
    Mini,
    SealTest,
    Subthreshold,
}

impl AnalysisKind {
    /// File name prefix of exported tables
    pub fn prefix(self) -> &'static str {
        match self {
            AnalysisKind::Spike => "ap",
            AnalysisKind::Mini => "mini",
            AnalysisKind::SealTest => "st",
            AnalysisKind::Subthreshold => "sub",
        }
    }

    /// Kind of the analyzer with the given name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "spike" => Some(AnalysisKind::Spike),
            "mini" => Some(AnalysisKind::Mini),
            "seal_test" => Some(AnalysisKind::SealTest),
            "subthreshold" => Some(AnalysisKind::Subthreshold),
            _ => None,
        }
    }
}

/// Table of one analysis kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "table")]
pub enum StoredTable {
    Spike(SpikeTable),
    Mini(MiniTable),
    SealTest(MembraneTable),
    Subthreshold(MembraneTable),
}

impl StoredTable {
    pub fn kind(&self) -> AnalysisKind {
        match self {
            StoredTable::Spike(_) => AnalysisKind::Spike,
            StoredTable::Mini(_) => AnalysisKind::Mini,
            StoredTable::SealTest(_) => AnalysisKind::SealTest,
            StoredTable::Subthreshold(_) => AnalysisKind::Subthreshold,
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            StoredTable::Spike(t) => &t.protocol,
            StoredTable::Mini(t) => &t.protocol,
            StoredTable::SealTest(t) | StoredTable::Subthreshold(t) => &t.protocol,
        }
    }

    /// Number of analyzed trials
    pub fn len(&self) -> usize {
        match self {
            StoredTable::Spike(t) => t.len(),
            StoredTable::Mini(t) => t.len(),
            StoredTable::SealTest(t) | StoredTable::Subthreshold(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn csv_error(e: csv::Error) -> WcpError {
    WcpError::Io {
        reason: e.to_string(),
    }
}

fn json_error(e: serde_json::Error) -> WcpError {
    WcpError::Serialization {
        reason: e.to_string(),
    }
}

/// Write rows with a header to a CSV file
pub fn write_csv<I>(path: &Path, header: &[&str], rows: I) -> WcpResult<()>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    writer.write_record(header).map_err(csv_error)?;
    for row in rows {
        writer.write_record(&row).map_err(csv_error)?;
    }
    writer.flush()?;
    debug!(path = %path.display(), "wrote csv");
    Ok(())
}

/// Event rows keyed by (cell, trial, event index)
pub fn write_events<E: Columns, S>(table: &ResultTable<E, S>, path: &Path) -> WcpResult<()> {
    let mut header = vec!["cell", "trial", "event"];
    header.extend(E::header());
    let rows = table.events().iter().map(|row| {
        let mut fields = vec![row.cell.to_string(), row.trial.to_string(), row.index.to_string()];
        fields.extend(row.record.fields());
        fields
    });
    write_csv(path, &header, rows)
}

/// Trial rows keyed by (cell, trial)
pub fn write_trials<E, S: Columns>(table: &ResultTable<E, S>, path: &Path) -> WcpResult<()> {
    let mut header = vec!["cell", "trial"];
    header.extend(S::header());
    let rows = table.trials().iter().map(|row| {
        let mut fields = vec![row.cell.to_string(), row.trial.to_string()];
        fields.extend(row.summary.fields());
        fields
    });
    write_csv(path, &header, rows)
}

/// Aggregated per-cell rows
pub fn write_rows<R: Columns>(rows: &[R], path: &Path) -> WcpResult<()> {
    write_csv(path, &R::header(), rows.iter().map(R::fields))
}

/// One result table per (analysis kind, protocol). Storing a table again
/// replaces the previous run.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    tables: BTreeMap<(AnalysisKind, String), StoredTable>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a table, returning the one it replaces
    pub fn insert(&mut self, table: impl Into<StoredTable>) -> Option<StoredTable> {
        let table = table.into();
        let key = (table.kind(), table.protocol().to_string());
        info!(kind = ?key.0, protocol = %key.1, trials = table.len(), "storing result table");
        self.tables.insert(key, table)
    }

    pub fn get(&self, kind: AnalysisKind, protocol: &str) -> Option<&StoredTable> {
        self.tables.get(&(kind, protocol.to_string()))
    }

    pub fn remove(&mut self, kind: AnalysisKind, protocol: &str) -> Option<StoredTable> {
        self.tables.remove(&(kind, protocol.to_string()))
    }

    pub fn spikes(&self, protocol: &str) -> Option<&SpikeTable> {
        match self.get(AnalysisKind::Spike, protocol) {
            Some(StoredTable::Spike(t)) => Some(t),
            _ => None,
        }
    }

    pub fn minis(&self, protocol: &str) -> Option<&MiniTable> {
        match self.get(AnalysisKind::Mini, protocol) {
            Some(StoredTable::Mini(t)) => Some(t),
            _ => None,
        }
    }

    pub fn seal_tests(&self, protocol: &str) -> Option<&MembraneTable> {
        match self.get(AnalysisKind::SealTest, protocol) {
            Some(StoredTable::SealTest(t)) => Some(t),
            _ => None,
        }
    }

    pub fn subthreshold(&self, protocol: &str) -> Option<&MembraneTable> {
        match self.get(AnalysisKind::Subthreshold, protocol) {
            Some(StoredTable::Subthreshold(t)) => Some(t),
            _ => None,
        }
    }

    /// Stored (kind, protocol) pairs
    pub fn keys(&self) -> Vec<(AnalysisKind, String)> {
        self.tables.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Export one table as `<prefix>_<protocol>.csv` (events, or trials for
    /// membrane tests) and `<prefix>_<protocol>_trials.csv` for event tables.
    /// Returns the written paths.
    pub fn export_csv(&self, kind: AnalysisKind, protocol: &str, dir: &Path) -> WcpResult<Vec<PathBuf>> {
        let table = self.get(kind, protocol).ok_or_else(|| WcpError::Io {
            reason: format!("no {:?} results for protocol '{}'", kind, protocol),
        })?;
        fs::create_dir_all(dir)?;
        let base = format!("{}_{}", kind.prefix(), protocol);
        let main = dir.join(format!("{}.csv", base));
        let trials = dir.join(format!("{}_trials.csv", base));
        let written = match table {
            StoredTable::Spike(t) => {
                write_events(t, &main)?;
                write_trials(t, &trials)?;
                vec![main, trials]
            }
            StoredTable::Mini(t) => {
                write_events(t, &main)?;
                write_trials(t, &trials)?;
                vec![main, trials]
            }
            StoredTable::SealTest(t) | StoredTable::Subthreshold(t) => {
                write_trials(t, &main)?;
                vec![main]
            }
        };
        info!(files = written.len(), dir = %dir.display(), "exported {}", base);
        Ok(written)
    }

    /// Export every stored table
    pub fn export_all_csv(&self, dir: &Path) -> WcpResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (kind, protocol) in self.keys() {
            written.extend(self.export_csv(kind, &protocol, dir)?);
        }
        Ok(written)
    }

    pub fn to_json(&self) -> WcpResult<String> {
        let tables: Vec<&StoredTable> = self.tables.values().collect();
        serde_json::to_string_pretty(&tables).map_err(json_error)
    }

    pub fn from_json(json: &str) -> WcpResult<Self> {
        let tables: Vec<StoredTable> = serde_json::from_str(json).map_err(json_error)?;
        let mut store = Self::new();
        for table in tables {
            store.insert(table);
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> WcpResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Load a saved store; a missing file gives an empty store
    pub fn load_or_default(path: &Path) -> WcpResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        Self::from_json(&fs::read_to_string(path)?)
    }
}

impl From<SpikeTable> for StoredTable {
    fn from(table: SpikeTable) -> Self {
        StoredTable::Spike(table)
    }
}

impl From<MiniTable> for StoredTable {
    fn from(table: MiniTable) -> Self {
        StoredTable::Mini(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wcp_core::{
        ClampMode, MembraneFitStatus, MembraneSummary, SpikeRecord, SpikeTrialSummary, TrialKey,
    };

    fn spike_table(protocol: &str, rate: f64) -> SpikeTable {
        let mut table = SpikeTable::new(protocol);
        let record = SpikeRecord {
            onset: 2_000,
            onset_time: 0.1,
            peak_time: 0.1005,
            trough_time: 0.1015,
            slope: 200.0,
            amplitude: 0.1,
            threshold: -0.05,
            half_width: 0.0008,
            mahp: None,
        };
        let summary = SpikeTrialSummary {
            stimulus_amplitude: 1e-10,
            rate,
            spike_count: 1,
            sahp: Some(0.001),
        };
        table.push_trial(TrialKey::new(1, 1), vec![record], summary);
        table
    }

    fn seal_table() -> MembraneTable {
        let mut table = MembraneTable::new("seal");
        let summary = MembraneSummary {
            clamp_mode: ClampMode::Voltage,
            stimulus_amplitude: -0.005,
            baseline: 0.0,
            steady_state: -2.4e-11,
            rin: 2e8,
            rs: 1e7,
            cm: 2e-10,
            tau: Some(0.0019),
            sag: None,
            status: MembraneFitStatus::Fitted,
        };
        table.push_trial(TrialKey::new(1, 1), Vec::new(), summary);
        table
    }

    #[test]
    fn test_rerun_replaces_table() {
        let mut store = ResultStore::new();
        assert!(store.insert(spike_table("step", 5.0)).is_none());
        let replaced = store.insert(spike_table("step", 8.0));
        assert!(replaced.is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(store.spikes("step").unwrap().trials()[0].summary.rate, 8.0);
        assert!(store.minis("step").is_none());
    }

    #[test]
    fn test_csv_export() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ResultStore::new();
        store.insert(spike_table("step", 5.0));
        store.insert(StoredTable::SealTest(seal_table()));

        let written = store.export_all_csv(dir.path()).unwrap();
        assert_eq!(written.len(), 3);

        let events = fs::read_to_string(dir.path().join("ap_step.csv")).unwrap();
        let mut lines = events.lines();
        assert!(lines.next().unwrap().starts_with("cell,trial,event,onset"));
        assert!(lines.next().unwrap().starts_with("1,1,0,2000"));

        let seal = fs::read_to_string(dir.path().join("st_seal.csv")).unwrap();
        assert!(seal.lines().next().unwrap().contains("Rin"));
        assert!(seal.contains("fitted"));
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let mut store = ResultStore::new();
        store.insert(spike_table("step", 5.0));
        store.insert(StoredTable::SealTest(seal_table()));
        store.save(&path).unwrap();

        let loaded = ResultStore::load_or_default(&path).unwrap();
        assert_eq!(loaded.keys(), store.keys());
        assert_eq!(loaded.seal_tests("seal").unwrap().trials()[0].summary.rin, 2e8);
        assert!(ResultStore::load_or_default(&dir.path().join("none.json")).unwrap().is_empty());
    }

    #[test]
    fn test_missing_table_export() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new();
        assert!(store.export_csv(AnalysisKind::Mini, "x", dir.path()).is_err());
    }
}
