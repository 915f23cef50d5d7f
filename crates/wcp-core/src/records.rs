//! Result records produced by the analyzers and the per-protocol result table

use crate::trace::ClampMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Cell identifier within a project
pub type CellId = u32;
/// Trial identifier within a cell
pub type TrialId = u32;

/// Key of one processed trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialKey {
    pub cell: CellId,
    pub trial: TrialId,
}

impl TrialKey {
    pub fn new(cell: CellId, trial: TrialId) -> Self {
        Self { cell, trial }
    }
}

impl std::fmt::Display for TrialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cell {} trial {}", self.cell, self.trial)
    }
}

/// Flat column view used by the tabular exporters
pub trait Columns {
    /// Column names, in field order
    fn header() -> Vec<&'static str>;
    /// Field values rendered as text, same order as `header`
    fn fields(&self) -> Vec<String>;
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// One detected action potential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeRecord {
    /// Onset sample index
    pub onset: usize,
    /// Onset time in seconds
    pub onset_time: f64,
    /// Peak time in seconds
    pub peak_time: f64,
    /// Trough time in seconds (minimum after the peak)
    pub trough_time: f64,
    /// Maximum rise slope before the peak, units per second
    pub slope: f64,
    /// Peak minus onset value
    pub amplitude: f64,
    /// Value at onset
    pub threshold: f64,
    /// Width at half amplitude in seconds
    pub half_width: f64,
    /// Medium after-hyperpolarization, when the window fits before the next spike
    pub mahp: Option<f64>,
}

impl Columns for SpikeRecord {
    fn header() -> Vec<&'static str> {
        vec![
            "onset", "onset_time", "peak_time", "trough_time", "slope", "amp",
            "threshold", "width", "mAHP",
        ]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.onset.to_string(),
            self.onset_time.to_string(),
            self.peak_time.to_string(),
            self.trough_time.to_string(),
            self.slope.to_string(),
            self.amplitude.to_string(),
            self.threshold.to_string(),
            self.half_width.to_string(),
            opt(self.mahp),
        ]
    }
}

/// Trial-level spike properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeTrialSummary {
    /// Stimulus amplitude of the trial
    pub stimulus_amplitude: f64,
    /// Spikes per second of stimulation
    pub rate: f64,
    /// Number of spikes
    pub spike_count: usize,
    /// Slow after-hyperpolarization: baseline mean minus post-stimulus mean
    pub sahp: Option<f64>,
}

impl Columns for SpikeTrialSummary {
    fn header() -> Vec<&'static str> {
        vec!["stimAmp", "rate", "count", "sAHP"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.stimulus_amplitude.to_string(),
            self.rate.to_string(),
            self.spike_count.to_string(),
            opt(self.sahp),
        ]
    }
}

/// One accepted miniature synaptic event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiniRecord {
    /// Rise time in seconds, absolute within the trace
    pub rise_time: f64,
    /// Peak time in seconds, absolute within the trace
    pub peak_time: f64,
    /// Amplitude over local baseline in physical units
    pub amplitude: f64,
    /// Decay time constant in seconds
    pub decay_tau: f64,
    /// Rise time constant in seconds
    pub rise_tau: f64,
    /// Residual norm of the double-exponential fit (scaled units)
    pub residual: f64,
}

impl Columns for MiniRecord {
    fn header() -> Vec<&'static str> {
        vec!["riseTime", "peakTime", "amp", "decayTau", "riseTau", "residual"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.rise_time.to_string(),
            self.peak_time.to_string(),
            self.amplitude.to_string(),
            self.decay_tau.to_string(),
            self.rise_tau.to_string(),
            self.residual.to_string(),
        ]
    }
}

/// Trial-level mini properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiniTrialSummary {
    /// Accepted events
    pub event_count: usize,
    /// Analyzed duration in seconds
    pub duration: f64,
}

impl Columns for MiniTrialSummary {
    fn header() -> Vec<&'static str> {
        vec!["num", "dur"]
    }

    fn fields(&self) -> Vec<String> {
        vec![self.event_count.to_string(), self.duration.to_string()]
    }
}

/// How the membrane properties of a trial were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembraneFitStatus {
    /// Exponential fit accepted
    Fitted,
    /// Fit abandoned, steady-state estimate only
    Abandoned,
    /// Series resistance compensated, fitting skipped
    Compensated,
}

impl std::fmt::Display for MembraneFitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembraneFitStatus::Fitted => write!(f, "fitted"),
            MembraneFitStatus::Abandoned => write!(f, "abandoned"),
            MembraneFitStatus::Compensated => write!(f, "compensated"),
        }
    }
}

/// Passive membrane properties of one trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembraneSummary {
    pub clamp_mode: ClampMode,
    /// Step amplitude used for the resistance estimates
    pub stimulus_amplitude: f64,
    /// Mean of the baseline window
    pub baseline: f64,
    /// Mean of the steady-state window
    pub steady_state: f64,
    /// Input resistance in ohms
    pub rin: f64,
    /// Series (access) resistance in ohms
    pub rs: f64,
    /// Membrane capacitance in farads
    pub cm: f64,
    /// Charging time constant in seconds, when a fit was kept
    pub tau: Option<f64>,
    /// Sag ratio (subthreshold protocol only)
    pub sag: Option<f64>,
    pub status: MembraneFitStatus,
}

impl Columns for MembraneSummary {
    fn header() -> Vec<&'static str> {
        vec![
            "mode", "stimAmp", "baseline", "steadyState", "Rin", "Rs", "Cm", "tau", "sag",
            "status",
        ]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            match self.clamp_mode {
                ClampMode::Voltage => "VC".to_string(),
                ClampMode::Current => "CC".to_string(),
            },
            self.stimulus_amplitude.to_string(),
            self.baseline.to_string(),
            self.steady_state.to_string(),
            self.rin.to_string(),
            self.rs.to_string(),
            self.cm.to_string(),
            opt(self.tau),
            opt(self.sag),
            self.status.to_string(),
        ]
    }
}

impl Columns for () {
    fn header() -> Vec<&'static str> {
        Vec::new()
    }

    fn fields(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Event row keyed by (cell, trial, event index)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow<E> {
    pub cell: CellId,
    pub trial: TrialId,
    pub index: usize,
    pub record: E,
}

/// Trial row keyed by (cell, trial)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRow<S> {
    pub cell: CellId,
    pub trial: TrialId,
    pub summary: S,
}

/// Trial that could not be analyzed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub cell: CellId,
    pub trial: TrialId,
    pub reason: String,
}

/// Per-protocol result table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultTable<E, S> {
    /// Protocol the table was produced from
    pub protocol: String,
    /// Identifier of the run that produced the table
    pub run_id: Uuid,
    /// Run start time
    pub created_at: DateTime<Utc>,
    events: Vec<EventRow<E>>,
    trials: Vec<TrialRow<S>>,
    failures: Vec<TrialFailure>,
}

/// Spike events and trial summaries
pub type SpikeTable = ResultTable<SpikeRecord, SpikeTrialSummary>;
/// Mini events and trial summaries
pub type MiniTable = ResultTable<MiniRecord, MiniTrialSummary>;
/// Membrane summaries, no per-event rows
pub type MembraneTable = ResultTable<(), MembraneSummary>;

impl<E, S> ResultTable<E, S> {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            events: Vec::new(),
            trials: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Store the result of one trial. Rows already stored for the same
    /// (cell, trial) are replaced.
    pub fn push_trial(&mut self, key: TrialKey, events: Vec<E>, summary: S) {
        self.remove(key);
        self.events.extend(events.into_iter().enumerate().map(|(index, record)| EventRow {
            cell: key.cell,
            trial: key.trial,
            index,
            record,
        }));
        self.trials.push(TrialRow {
            cell: key.cell,
            trial: key.trial,
            summary,
        });
    }

    /// Record a trial whose analysis failed
    pub fn push_failure(&mut self, key: TrialKey, reason: impl Into<String>) {
        self.remove(key);
        self.failures.push(TrialFailure {
            cell: key.cell,
            trial: key.trial,
            reason: reason.into(),
        });
    }

    fn remove(&mut self, key: TrialKey) {
        self.events.retain(|r| (r.cell, r.trial) != (key.cell, key.trial));
        self.trials.retain(|r| (r.cell, r.trial) != (key.cell, key.trial));
        self.failures.retain(|r| (r.cell, r.trial) != (key.cell, key.trial));
    }

    pub fn events(&self) -> &[EventRow<E>] {
        &self.events
    }

    pub fn trials(&self) -> &[TrialRow<S>] {
        &self.trials
    }

    pub fn failures(&self) -> &[TrialFailure] {
        &self.failures
    }

    /// Summary of one trial
    pub fn trial(&self, key: TrialKey) -> Option<&S> {
        self.trials
            .iter()
            .find(|r| r.cell == key.cell && r.trial == key.trial)
            .map(|r| &r.summary)
    }

    /// Events of one trial in detection order
    pub fn events_for(&self, key: TrialKey) -> impl Iterator<Item = &EventRow<E>> {
        self.events
            .iter()
            .filter(move |r| r.cell == key.cell && r.trial == key.trial)
    }

    /// Cells with at least one analyzed trial
    pub fn cells(&self) -> BTreeSet<CellId> {
        self.trials.iter().map(|r| r.cell).collect()
    }

    /// Number of analyzed trials
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mini(t: f64) -> MiniRecord {
        MiniRecord {
            rise_time: t,
            peak_time: t + 0.001,
            amplitude: 2e-11,
            decay_tau: 0.004,
            rise_tau: 0.0005,
            residual: 0.05,
        }
    }

    #[test]
    fn test_push_replaces_same_trial() {
        let mut table = MiniTable::new("mini");
        let key = TrialKey::new(1, 3);
        table.push_trial(key, vec![mini(0.1), mini(0.2)], MiniTrialSummary {
            event_count: 2,
            duration: 1.0,
        });
        table.push_trial(TrialKey::new(2, 1), vec![mini(0.3)], MiniTrialSummary {
            event_count: 1,
            duration: 1.0,
        });
        table.push_trial(key, vec![mini(0.5)], MiniTrialSummary {
            event_count: 1,
            duration: 2.0,
        });

        assert_eq!(table.len(), 2);
        assert_eq!(table.events().len(), 2);
        assert_eq!(table.trial(key).unwrap().duration, 2.0);
        let rows: Vec<_> = table.events_for(key).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].index, 0);
        assert_eq!(rows[0].record.rise_time, 0.5);
    }

    #[test]
    fn test_failure_replaces_summary() {
        let mut table = MembraneTable::new("seal");
        let key = TrialKey::new(4, 1);
        table.push_trial(key, vec![], MembraneSummary {
            clamp_mode: ClampMode::Voltage,
            stimulus_amplitude: -0.005,
            baseline: 0.0,
            steady_state: -1e-11,
            rin: 5e8,
            rs: 0.0,
            cm: 0.0,
            tau: None,
            sag: None,
            status: MembraneFitStatus::Abandoned,
        });
        table.push_failure(key, "bad window");
        assert!(table.is_empty());
        assert_eq!(table.failures().len(), 1);
        assert!(table.cells().is_empty());
    }

    #[test]
    fn test_columns_align() {
        let record = mini(0.1);
        assert_eq!(MiniRecord::header().len(), record.fields().len());
        let summary = SpikeTrialSummary {
            stimulus_amplitude: 1e-10,
            rate: 4.0,
            spike_count: 2,
            sahp: None,
        };
        let fields = summary.fields();
        assert_eq!(SpikeTrialSummary::header().len(), fields.len());
        assert_eq!(fields[3], "");
    }
}
