//! Difference of averaged step responses between two protocols
//!
//! For each cell and stimulus amplitude, the baseline-normalized traces of
//! each protocol are averaged and the steady-state mean of their difference
//! is reported, e.g. the current blocked by a drug.

use crate::source::TraceSource;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wcp_core::{trace_error, CellId, Columns, Trace, WcpResult};
use wcp_processing::{same_amplitude, select_cells, stats, thresholded_median_filter, SubthresholdParams};

const MEDIAN_WINDOW: usize = 5;
const MEDIAN_THRESHOLD: f64 = 5e-10;

/// Steady-state difference of one cell at one stimulus amplitude
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferenceRow {
    pub cell: CellId,
    pub stimulus_amplitude: f64,
    /// Mean of `protocol1 - protocol0` over the steady-state window
    pub amplitude: f64,
    pub cell_type: Option<String>,
}

impl Columns for DifferenceRow {
    fn header() -> Vec<&'static str> {
        vec!["cell", "stim", "amp", "type"]
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.cell.to_string(),
            self.stimulus_amplitude.to_string(),
            self.amplitude.to_string(),
            self.cell_type.clone().unwrap_or_default(),
        ]
    }
}

/// File name of an exported difference table
pub fn difference_file_name(protocol0: &str, protocol1: &str) -> String {
    format!("diff_{}_{}.csv", protocol0, protocol1)
}

/// Median-filtered trace minus its pre-stimulus baseline mean
fn normalized(trace: &Trace, params: &SubthresholdParams) -> WcpResult<Vec<f64>> {
    let t0 = trace.require_stimulus()?.start;
    let x = thresholded_median_filter(trace.samples(), MEDIAN_WINDOW, MEDIAN_THRESHOLD)?;
    let lo = trace.index_at(t0 + params.baseline_start).min(x.len());
    let hi = trace.index_at(t0 + params.baseline_end).min(x.len());
    let baseline = stats::mean(&x[lo..hi.max(lo)]).ok_or_else(|| trace_error!("baseline window is empty"))?;
    Ok(x.iter().map(|v| v - baseline).collect())
}

/// Sample-wise mean, truncated to the shortest trace
fn average(traces: &[Vec<f64>]) -> Option<Vec<f64>> {
    let len = traces.iter().map(Vec::len).min()?;
    let n = traces.len() as f64;
    Some((0..len).map(|i| traces.iter().map(|t| t[i]).sum::<f64>() / n).collect())
}

/// Loaded trials of one cell in one protocol, grouped by stimulus amplitude
fn group_by_stimulus(
    source: &dyn TraceSource,
    cell: CellId,
    protocol: &str,
    params: &SubthresholdParams,
) -> WcpResult<Vec<(f64, Trace, Vec<Vec<f64>>)>> {
    let mut groups: Vec<(f64, Trace, Vec<Vec<f64>>)> = Vec::new();
    for key in source.iterate_trials(protocol).into_iter().filter(|k| k.cell == cell) {
        let trace = source.load_trace(key.cell, key.trial)?;
        let amplitude = trace.require_stimulus()?.amplitude;
        let x = normalized(&trace, params)?;
        match groups.iter_mut().find(|(a, _, _)| same_amplitude(*a, amplitude)) {
            Some((_, _, traces)) => traces.push(x),
            None => groups.push((amplitude, trace, vec![x])),
        }
    }
    Ok(groups)
}

/// Steady-state difference `protocol1 - protocol0` per (cell, stimulus).
/// Stimuli recorded only in `protocol0` are skipped. Windows are taken from
/// `params`, relative to the stimulus onset.
pub fn subtract_protocols(
    source: &dyn TraceSource,
    protocol0: &str,
    protocol1: &str,
    params: &SubthresholdParams,
    cells: Option<&[CellId]>,
) -> WcpResult<Vec<DifferenceRow>> {
    let recorded = source.iterate_trials(protocol0).iter().map(|k| k.cell).collect();
    let cells = select_cells(&recorded, &source.selected_cells(), cells);
    let types = source.assigned_types();
    let mut rows = Vec::new();

    for cell in cells {
        let before = group_by_stimulus(source, cell, protocol0, params)?;
        let after = group_by_stimulus(source, cell, protocol1, params)?;
        for (amplitude, reference, traces0) in &before {
            let Some((_, _, traces1)) = after.iter().find(|(a, _, _)| same_amplitude(*a, *amplitude)) else {
                warn!(cell, stimulus = amplitude, protocol = protocol1, "no matching stimulus");
                continue;
            };
            let (Some(mean0), Some(mean1)) = (average(traces0), average(traces1)) else {
                continue;
            };
            let diff: Vec<f64> = mean1.iter().zip(&mean0).map(|(b, a)| b - a).collect();

            let t0 = reference.require_stimulus()?.start;
            let lo = reference.index_at(t0 + params.steady_state_start).min(diff.len());
            let hi = reference.index_at(t0 + params.steady_state_end).min(diff.len());
            let Some(amp) = stats::mean(&diff[lo..hi.max(lo)]) else {
                warn!(cell, stimulus = amplitude, "steady-state window outside the traces");
                continue;
            };
            debug!(cell, stimulus = amplitude, amp, "protocol difference");
            rows.push(DifferenceRow {
                cell,
                stimulus_amplitude: *amplitude,
                amplitude: amp,
                cell_type: types.get(&cell).cloned(),
            });
        }
    }
    Ok(rows)
}
