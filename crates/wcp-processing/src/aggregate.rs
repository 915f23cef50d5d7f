//! Per-cell aggregation of result tables
//!
//! Every row carries the cell type label assigned by the data collaborator.
//! Range filters `[lo, hi)` only apply when `lo < hi`.

use crate::stats;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;
use wcp_core::{CellId, Columns, MembraneTable, MiniTable, SpikeTable, TrialKey};

/// Cell type labels by cell
pub type CellTypes = BTreeMap<CellId, String>;

fn opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn in_range(value: f64, [lo, hi]: [f64; 2]) -> bool {
    lo >= hi || (lo <= value && value < hi)
}

/// Stimulus amplitudes equal up to relative rounding
pub fn same_amplitude(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

/// Cells to aggregate: the analyzed cells, restricted to the collaborator's
/// selection and to `requested` when given
pub fn select_cells(
    analyzed: &BTreeSet<CellId>,
    selected: &BTreeSet<CellId>,
    requested: Option<&[CellId]>,
) -> BTreeSet<CellId> {
    analyzed
        .intersection(selected)
        .copied()
        .filter(|c| requested.map_or(true, |r| r.contains(c)))
        .collect()
}

/// Mean firing rate of one cell at one stimulus amplitude
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiringRateRow {
    pub cell: CellId,
    pub stimulus_amplitude: f64,
    pub rate: f64,
    pub trials: usize,
    pub cell_type: Option<String>,
}

impl Columns for FiringRateRow {
    fn header() -> Vec<&'static str> {
        vec!["cell", "stimAmp", "rate", "trials", "type"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.cell.to_string(),
            self.stimulus_amplitude.to_string(),
            self.rate.to_string(),
            self.trials.to_string(),
            self.cell_type.clone().unwrap_or_default(),
        ]
    }
}

/// Average firing rate per (cell, stimulus amplitude), optionally restricted
/// to the listed amplitudes
pub fn firing_rates(
    table: &SpikeTable,
    cells: &BTreeSet<CellId>,
    stimuli: Option<&[f64]>,
    types: &CellTypes,
) -> Vec<FiringRateRow> {
    let mut groups: Vec<(CellId, f64, Vec<f64>)> = Vec::new();
    for row in table.trials().iter().filter(|r| cells.contains(&r.cell)) {
        let amp = row.summary.stimulus_amplitude;
        if let Some(list) = stimuli {
            if !list.iter().any(|&s| same_amplitude(s, amp)) {
                continue;
            }
        }
        match groups
            .iter_mut()
            .find(|(c, a, _)| *c == row.cell && same_amplitude(*a, amp))
        {
            Some((_, _, rates)) => rates.push(row.summary.rate),
            None => groups.push((row.cell, amp, vec![row.summary.rate])),
        }
    }
    groups.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));

    groups
        .into_iter()
        .filter_map(|(cell, amp, rates)| {
            Some(FiringRateRow {
                cell,
                stimulus_amplitude: amp,
                rate: stats::mean(&rates)?,
                trials: rates.len(),
                cell_type: types.get(&cell).cloned(),
            })
        })
        .collect()
}

/// Mean spike shape of one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeAverages {
    pub cell: CellId,
    pub spikes: usize,
    pub slope: f64,
    pub amplitude: f64,
    pub threshold: f64,
    pub half_width: f64,
    pub mahp: Option<f64>,
    pub sahp: Option<f64>,
    pub cell_type: Option<String>,
}

impl Columns for SpikeAverages {
    fn header() -> Vec<&'static str> {
        vec!["cell", "spikes", "slope", "amp", "threshold", "width", "mAHP", "sAHP", "type"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.cell.to_string(),
            self.spikes.to_string(),
            self.slope.to_string(),
            self.amplitude.to_string(),
            self.threshold.to_string(),
            self.half_width.to_string(),
            opt(self.mahp),
            opt(self.sahp),
            self.cell_type.clone().unwrap_or_default(),
        ]
    }
}

/// Average per-spike properties per cell. Trials are kept when their rate is
/// in `rate_range`; spikes when their 1-based number is in `spike_range`.
pub fn average_spike_properties(
    table: &SpikeTable,
    cells: &BTreeSet<CellId>,
    rate_range: [f64; 2],
    spike_range: [usize; 2],
    types: &CellTypes,
) -> Vec<SpikeAverages> {
    let [first, last] = spike_range;
    let mut rows = Vec::new();
    for &cell in cells {
        let trials: Vec<_> = table
            .trials()
            .iter()
            .filter(|r| r.cell == cell && in_range(r.summary.rate, rate_range))
            .collect();
        let keys: BTreeSet<TrialKey> = trials.iter().map(|r| TrialKey::new(r.cell, r.trial)).collect();
        let spikes: Vec<_> = table
            .events()
            .iter()
            .filter(|e| keys.contains(&TrialKey::new(e.cell, e.trial)))
            .filter(|e| first >= last || (first <= e.index + 1 && e.index + 1 < last))
            .map(|e| &e.record)
            .collect();
        if spikes.is_empty() {
            continue;
        }

        let mean_of = |f: fn(&wcp_core::SpikeRecord) -> f64| {
            let values: Vec<f64> = spikes.iter().map(|s| f(s)).collect();
            stats::mean(&values).unwrap_or(f64::NAN)
        };
        rows.push(SpikeAverages {
            cell,
            spikes: spikes.len(),
            slope: mean_of(|s| s.slope),
            amplitude: mean_of(|s| s.amplitude),
            threshold: mean_of(|s| s.threshold),
            half_width: mean_of(|s| s.half_width),
            mahp: stats::finite_mean(spikes.iter().filter_map(|s| s.mahp)),
            sahp: stats::finite_mean(trials.iter().filter_map(|r| r.summary.sahp)),
            cell_type: types.get(&cell).cloned(),
        });
    }
    rows
}

/// Smallest stimulus amplitude that made a cell fire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RheobaseRow {
    pub cell: CellId,
    pub rheobase: f64,
    pub cell_type: Option<String>,
}

impl Columns for RheobaseRow {
    fn header() -> Vec<&'static str> {
        vec!["cell", "rheobase", "type"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.cell.to_string(),
            self.rheobase.to_string(),
            self.cell_type.clone().unwrap_or_default(),
        ]
    }
}

/// Rheobase per cell; cells that never fired are left out
pub fn rheobase(table: &SpikeTable, cells: &BTreeSet<CellId>, types: &CellTypes) -> Vec<RheobaseRow> {
    cells
        .iter()
        .filter_map(|&cell| {
            let amplitudes: Vec<f64> = table
                .trials()
                .iter()
                .filter(|r| r.cell == cell && r.summary.rate > 0.0)
                .map(|r| r.summary.stimulus_amplitude)
                .collect();
            Some(RheobaseRow {
                cell,
                rheobase: stats::min(&amplitudes)?,
                cell_type: types.get(&cell).cloned(),
            })
        })
        .collect()
}

/// Spike frequency adaptation of one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccommodationRow {
    pub cell: CellId,
    /// Early instantaneous rate over late instantaneous rate
    pub ratio: f64,
    pub trials: usize,
    pub cell_type: Option<String>,
}

impl Columns for AccommodationRow {
    fn header() -> Vec<&'static str> {
        vec!["cell", "accommodation", "trials", "type"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.cell.to_string(),
            self.ratio.to_string(),
            self.trials.to_string(),
            self.cell_type.clone().unwrap_or_default(),
        ]
    }
}

/// Accommodation ratio per cell: instantaneous rate (1/ISI) of the `early`
/// interval divided by that of the `late` interval, intervals numbered from 1.
/// Trials with too few spikes are skipped.
pub fn accommodation(
    table: &SpikeTable,
    cells: &BTreeSet<CellId>,
    early: usize,
    late: usize,
    types: &CellTypes,
) -> Vec<AccommodationRow> {
    let early = early.max(1);
    let late = late.max(1);
    let mut rows = Vec::new();
    for &cell in cells {
        let mut ratios = Vec::new();
        for row in table.trials().iter().filter(|r| r.cell == cell) {
            let onsets: Vec<f64> = table
                .events_for(TrialKey::new(row.cell, row.trial))
                .map(|e| e.record.onset_time)
                .collect();
            let isi = |k: usize| onsets.get(k).zip(onsets.get(k - 1)).map(|(b, a)| b - a);
            if let (Some(a), Some(b)) = (isi(early), isi(late)) {
                if a > 0.0 && b > 0.0 {
                    ratios.push(b / a);
                }
            }
        }
        if let Some(ratio) = stats::mean(&ratios) {
            rows.push(AccommodationRow {
                cell,
                ratio,
                trials: ratios.len(),
                cell_type: types.get(&cell).cloned(),
            });
        }
    }
    rows
}

/// Seal-test resistance used to exclude poorly clamped trials
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ResistanceLimit {
    /// Keep trials whose access resistance is below the limit (ohms)
    Access(f64),
    /// Keep trials whose input resistance is below the limit (ohms)
    Input(f64),
}

/// Mean mini properties of one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiniAverages {
    pub cell: CellId,
    pub events: usize,
    pub duration: f64,
    /// Events per second over all kept trials
    pub rate: f64,
    pub amplitude: f64,
    pub decay_tau: f64,
    pub rise_tau: f64,
    pub cell_type: Option<String>,
}

impl Columns for MiniAverages {
    fn header() -> Vec<&'static str> {
        vec!["cell", "num", "dur", "rate", "amp", "tau", "riseTau", "type"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.cell.to_string(),
            self.events.to_string(),
            self.duration.to_string(),
            self.rate.to_string(),
            self.amplitude.to_string(),
            self.decay_tau.to_string(),
            self.rise_tau.to_string(),
            self.cell_type.clone().unwrap_or_default(),
        ]
    }
}

/// Mini averages and whether the resistance filter could be applied
#[derive(Debug, Clone, PartialEq)]
pub struct MiniAverageReport {
    pub rows: Vec<MiniAverages>,
    pub resistance_filter_applied: bool,
}

/// Per-cell mini averages.
///
/// With a resistance limit, only trials with a seal-test row below the limit
/// are kept. A missing seal-test table is reported and the limit ignored.
/// Cells need more than `min_events` events to be reported.
pub fn average_mini_properties(
    table: &MiniTable,
    cells: &BTreeSet<CellId>,
    seal_tests: Option<&MembraneTable>,
    limit: Option<ResistanceLimit>,
    min_events: usize,
    types: &CellTypes,
) -> MiniAverageReport {
    let allowed: Option<BTreeSet<TrialKey>> = match (limit, seal_tests) {
        (Some(limit), Some(seal)) => Some(
            seal.trials()
                .iter()
                .filter(|r| match limit {
                    ResistanceLimit::Access(max) => r.summary.rs < max,
                    ResistanceLimit::Input(max) => r.summary.rin < max,
                })
                .map(|r| TrialKey::new(r.cell, r.trial))
                .collect(),
        ),
        (Some(_), None) => {
            warn!(protocol = %table.protocol, "no seal test table, resistance filter not applied");
            None
        }
        _ => None,
    };

    let mut rows = Vec::new();
    for &cell in cells {
        let keep = |key: TrialKey| allowed.as_ref().map_or(true, |a| a.contains(&key));
        let trials: Vec<_> = table
            .trials()
            .iter()
            .filter(|r| r.cell == cell && keep(TrialKey::new(r.cell, r.trial)))
            .collect();
        let keys: BTreeSet<TrialKey> = trials.iter().map(|r| TrialKey::new(r.cell, r.trial)).collect();
        let events: Vec<_> = table
            .events()
            .iter()
            .filter(|e| keys.contains(&TrialKey::new(e.cell, e.trial)))
            .map(|e| &e.record)
            .collect();
        if events.len() <= min_events {
            continue;
        }

        let count: usize = trials.iter().map(|r| r.summary.event_count).sum();
        let duration: f64 = trials.iter().map(|r| r.summary.duration).sum();
        let mean_of = |f: fn(&wcp_core::MiniRecord) -> f64| {
            let values: Vec<f64> = events.iter().map(|e| f(e)).collect();
            stats::mean(&values).unwrap_or(f64::NAN)
        };
        rows.push(MiniAverages {
            cell,
            events: count,
            duration,
            rate: if duration > 0.0 { count as f64 / duration } else { f64::NAN },
            amplitude: mean_of(|e| e.amplitude),
            decay_tau: mean_of(|e| e.decay_tau),
            rise_tau: mean_of(|e| e.rise_tau),
            cell_type: types.get(&cell).cloned(),
        });
    }

    MiniAverageReport {
        rows,
        resistance_filter_applied: allowed.is_some(),
    }
}

/// Mean passive properties of one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembraneAverages {
    pub cell: CellId,
    pub trials: usize,
    pub rin: f64,
    pub rs: f64,
    pub cm: f64,
    pub tau: Option<f64>,
    pub sag: Option<f64>,
    pub cell_type: Option<String>,
}

impl Columns for MembraneAverages {
    fn header() -> Vec<&'static str> {
        vec!["cell", "trials", "Rin", "Rs", "Cm", "tau", "sag", "type"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.cell.to_string(),
            self.trials.to_string(),
            self.rin.to_string(),
            self.rs.to_string(),
            self.cm.to_string(),
            opt(self.tau),
            opt(self.sag),
            self.cell_type.clone().unwrap_or_default(),
        ]
    }
}

/// Per-cell mean over membrane test trials with stimulus amplitude in `stim_range`
pub fn average_membrane_properties(
    table: &MembraneTable,
    cells: &BTreeSet<CellId>,
    stim_range: [f64; 2],
    types: &CellTypes,
) -> Vec<MembraneAverages> {
    cells
        .iter()
        .filter_map(|&cell| {
            let rows: Vec<_> = table
                .trials()
                .iter()
                .filter(|r| r.cell == cell && in_range(r.summary.stimulus_amplitude, stim_range))
                .map(|r| &r.summary)
                .collect();
            let values = |f: fn(&wcp_core::MembraneSummary) -> f64| -> Vec<f64> { rows.iter().map(|s| f(s)).collect() };
            Some(MembraneAverages {
                cell,
                trials: rows.len(),
                rin: stats::mean(&values(|s| s.rin))?,
                rs: stats::mean(&values(|s| s.rs))?,
                cm: stats::mean(&values(|s| s.cm))?,
                tau: stats::finite_mean(rows.iter().filter_map(|s| s.tau)),
                sag: stats::finite_mean(rows.iter().filter_map(|s| s.sag)),
                cell_type: types.get(&cell).cloned(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wcp_core::{
        ClampMode, MembraneFitStatus, MembraneSummary, MiniRecord, MiniTrialSummary, SpikeRecord,
        SpikeTrialSummary,
    };

    fn spike(onset_time: f64) -> SpikeRecord {
        SpikeRecord {
            onset: (onset_time * 1000.0) as usize,
            onset_time,
            peak_time: onset_time + 0.001,
            trough_time: onset_time + 0.002,
            slope: 100.0,
            amplitude: 0.08,
            threshold: -0.04,
            half_width: 0.001,
            mahp: Some(0.005),
        }
    }

    fn spike_trial(amp: f64, onsets: &[f64]) -> (Vec<SpikeRecord>, SpikeTrialSummary) {
        let events: Vec<SpikeRecord> = onsets.iter().map(|&t| spike(t)).collect();
        let summary = SpikeTrialSummary {
            stimulus_amplitude: amp,
            rate: events.len() as f64 / 0.5,
            spike_count: events.len(),
            sahp: Some(0.001),
        };
        (events, summary)
    }

    fn spike_table() -> SpikeTable {
        let mut table = SpikeTable::new("IV");
        let trials = [
            (1, 1, 0.0, vec![]),
            (1, 2, 50e-12, vec![0.2]),
            (1, 3, 100e-12, vec![0.1, 0.15, 0.25, 0.4]),
            (1, 4, 100e-12, vec![0.1, 0.12, 0.16, 0.24]),
            (2, 1, 50e-12, vec![]),
            (2, 2, 100e-12, vec![0.3, 0.4]),
        ];
        for (cell, trial, amp, onsets) in trials {
            let (events, summary) = spike_trial(amp, &onsets);
            table.push_trial(TrialKey::new(cell, trial), events, summary);
        }
        table
    }

    fn types() -> CellTypes {
        CellTypes::from([(1, "pyramidal".to_string())])
    }

    #[test]
    fn test_select_cells() {
        let analyzed = BTreeSet::from([1, 2, 3]);
        let selected = BTreeSet::from([2, 3, 4]);
        assert_eq!(select_cells(&analyzed, &selected, None), BTreeSet::from([2, 3]));
        assert_eq!(select_cells(&analyzed, &selected, Some(&[3, 4][..])), BTreeSet::from([3]));
    }

    #[test]
    fn test_firing_rates_grouped() {
        let table = spike_table();
        let cells = table.cells();
        let rows = firing_rates(&table, &cells, None, &types());

        assert_eq!(rows.len(), 5);
        let c1 = rows
            .iter()
            .find(|r| r.cell == 1 && same_amplitude(r.stimulus_amplitude, 100e-12))
            .unwrap();
        assert_eq!(c1.trials, 2);
        assert!((c1.rate - 8.0).abs() < 1e-12);
        assert_eq!(c1.cell_type.as_deref(), Some("pyramidal"));
        assert!(rows.iter().filter(|r| r.cell == 2).all(|r| r.cell_type.is_none()));

        let only = firing_rates(&table, &cells, Some(&[50e-12][..]), &types());
        assert_eq!(only.len(), 2);
    }

    #[test]
    fn test_spike_number_range() {
        let table = spike_table();
        let cells = BTreeSet::from([1]);
        let all = average_spike_properties(&table, &cells, [0.0, 0.0], [0, 0], &types());
        assert_eq!(all[0].spikes, 9);

        let first_two = average_spike_properties(&table, &cells, [0.0, 0.0], [1, 3], &types());
        assert_eq!(first_two[0].spikes, 5);

        let fast_trials = average_spike_properties(&table, &cells, [5.0, 100.0], [0, 0], &types());
        assert_eq!(fast_trials[0].spikes, 8);
    }

    #[test]
    fn test_rheobase() {
        let table = spike_table();
        let rows = rheobase(&table, &table.cells(), &types());
        assert_eq!(rows.len(), 2);
        assert!(same_amplitude(rows[0].rheobase, 50e-12));
        assert!(same_amplitude(rows[1].rheobase, 100e-12));
    }

    #[test]
    fn test_accommodation() {
        let table = spike_table();
        let rows = accommodation(&table, &BTreeSet::from([1]), 1, 3, &types());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trials, 2);
        // trial 3: 0.15 / 0.05 = 3, trial 4: 0.08 / 0.02 = 4
        assert!((rows[0].ratio - 3.5).abs() < 1e-9);
    }

    fn mini_table() -> MiniTable {
        let mut table = MiniTable::new("spontaneous");
        let event = |amp: f64| MiniRecord {
            rise_time: 0.1,
            peak_time: 0.101,
            amplitude: amp,
            decay_tau: 0.005,
            rise_tau: 0.0005,
            residual: 0.1,
        };
        table.push_trial(
            TrialKey::new(1, 1),
            vec![event(10e-12), event(20e-12)],
            MiniTrialSummary { event_count: 2, duration: 10.0 },
        );
        table.push_trial(
            TrialKey::new(1, 2),
            vec![event(30e-12)],
            MiniTrialSummary { event_count: 1, duration: 10.0 },
        );
        table
    }

    fn seal_table() -> MembraneTable {
        let mut table = MembraneTable::new("spontaneous");
        for (trial, rs) in [(1, 10e6), (2, 40e6)] {
            table.push_trial(
                TrialKey::new(1, trial),
                Vec::new(),
                MembraneSummary {
                    clamp_mode: ClampMode::Voltage,
                    stimulus_amplitude: -0.005,
                    baseline: 0.0,
                    steady_state: -25e-12,
                    rin: 200e6,
                    rs,
                    cm: 100e-12,
                    tau: Some(0.001),
                    sag: None,
                    status: MembraneFitStatus::Fitted,
                },
            );
        }
        table
    }

    #[test]
    fn test_mini_averages() {
        let table = mini_table();
        let cells = BTreeSet::from([1]);
        let report = average_mini_properties(&table, &cells, None, None, 0, &types());
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].events, 3);
        assert!((report.rows[0].rate - 0.15).abs() < 1e-12);
        assert!((report.rows[0].amplitude - 20e-12).abs() < 1e-24);

        let strict = average_mini_properties(&table, &cells, None, None, 3, &types());
        assert!(strict.rows.is_empty());
    }

    #[test]
    fn test_mini_access_resistance_filter() {
        let table = mini_table();
        let seal = seal_table();
        let cells = BTreeSet::from([1]);
        let report = average_mini_properties(
            &table,
            &cells,
            Some(&seal),
            Some(ResistanceLimit::Access(20e6)),
            0,
            &types(),
        );
        assert!(report.resistance_filter_applied);
        assert_eq!(report.rows[0].events, 2);
        assert!((report.rows[0].rate - 0.2).abs() < 1e-12);

        let missing = average_mini_properties(&table, &cells, None, Some(ResistanceLimit::Access(20e6)), 0, &types());
        assert!(!missing.resistance_filter_applied);
        assert_eq!(missing.rows[0].events, 3);
    }

    #[test]
    fn test_membrane_averages() {
        let seal = seal_table();
        let rows = average_membrane_properties(&seal, &BTreeSet::from([1, 2]), [0.0, 0.0], &types());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trials, 2);
        assert!((rows[0].rs - 25e6).abs() < 1.0);
        assert_eq!(rows[0].sag, None);

        let none = average_membrane_properties(&seal, &BTreeSet::from([1]), [0.0, 1.0], &types());
        assert!(none.is_empty());
    }
}
