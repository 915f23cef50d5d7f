//! End-to-end batch runs over in-memory and directory projects

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use wcp_batch::{
    BatchRunner, BatchStatus, ChannelInspector, DirectoryTraceSource, InMemoryTraceSource,
    ProjectManifest, ResultStore, StopHandle, StoredTable, TraceSource,
};
use wcp_core::{CellId, MembraneFitStatus, Stimulus, Trace, TrialId, TrialKey, WcpResult};
use wcp_processing::{
    firing_rates, select_cells, AnalysisContext, CellTypes, CollectingSink, HeadlessInspector,
    MembraneTestAnalyzer, NullSink, SealTestParams, SpikeDetector, SpikeParams,
};
use wcp_simulation::{PatchSimulator, SimulationConfig, SpikeShape};

const SR: f64 = 20_000.0;

fn simulator() -> PatchSimulator {
    PatchSimulator::new(SimulationConfig {
        sample_rate: SR,
        duration: 1.0,
        noise_std: 0.0,
        seed: 5,
    })
    .unwrap()
}

fn spike_trace(amplitude: f64, onsets: &[f64]) -> Trace {
    simulator()
        .spike_train(Stimulus::new(0.1, 0.5, amplitude), onsets, &SpikeShape::default())
        .unwrap()
}

/// Stops the run once `stop_after` traces have been loaded
struct StoppingSource {
    inner: InMemoryTraceSource,
    stop: StopHandle,
    stop_after: usize,
    loaded: AtomicUsize,
}

impl TraceSource for StoppingSource {
    fn load_trace(&self, cell: CellId, trial: TrialId) -> WcpResult<Trace> {
        let trace = self.inner.load_trace(cell, trial)?;
        if self.loaded.fetch_add(1, Ordering::SeqCst) + 1 == self.stop_after {
            self.stop.stop();
        }
        Ok(trace)
    }

    fn iterate_trials(&self, protocol: &str) -> Vec<TrialKey> {
        self.inner.iterate_trials(protocol)
    }

    fn selected_cells(&self) -> BTreeSet<CellId> {
        self.inner.selected_cells()
    }

    fn assigned_types(&self) -> CellTypes {
        self.inner.assigned_types()
    }

    fn protocols(&self) -> Vec<String> {
        self.inner.protocols()
    }
}

#[test]
fn test_stop_after_k_of_n_trials() {
    let mut inner = InMemoryTraceSource::new();
    for trial in 1..=5 {
        inner.insert("step", TrialKey::new(1, trial), spike_trace(1e-10, &[0.2, 0.4]));
    }
    let stop = StopHandle::new();
    let source = StoppingSource {
        inner,
        stop: stop.clone(),
        stop_after: 2,
        loaded: AtomicUsize::new(0),
    };

    let detector = SpikeDetector::new(SpikeParams::default()).unwrap();
    let runner = BatchRunner::new(&source).with_stop_handle(stop);
    let mut inspector = HeadlessInspector;
    let mut sink = NullSink;
    let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
    let run = runner.run(&detector, "step", &mut ctx).unwrap();

    assert_eq!(run.status, BatchStatus::Stopped);
    assert_eq!(run.table.len(), 2);
    assert_eq!(run.stats.trials_processed, 2);
    assert_eq!(run.stats.trials_total, 5);
    let trials: Vec<TrialId> = run.table.trials().iter().map(|r| r.trial).collect();
    assert_eq!(trials, vec![1, 2]);
}

#[test]
fn test_zero_duration_stimulus_is_a_trial_failure() {
    let mut source = InMemoryTraceSource::new();
    let broken = Trace::new(vec![-0.07; 20_000], SR)
        .unwrap()
        .with_stimulus(Stimulus::new(0.1, 0.0, 1e-10));
    source.insert("step", TrialKey::new(1, 1), broken);
    source.insert("step", TrialKey::new(1, 2), spike_trace(1e-10, &[0.2]));

    let detector = SpikeDetector::new(SpikeParams::default()).unwrap();
    let mut inspector = HeadlessInspector;
    let mut sink = CollectingSink::default();
    let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
    let run = BatchRunner::new(&source).run(&detector, "step", &mut ctx).unwrap();

    assert_eq!(run.status, BatchStatus::Completed);
    assert_eq!(run.table.failures().len(), 1);
    assert_eq!(run.table.failures()[0].trial, 1);
    assert!(run.table.failures()[0].reason.starts_with("Invalid stimulus"));
    assert_eq!(run.table.trial(TrialKey::new(1, 2)).unwrap().spike_count, 1);
}

#[tokio::test]
async fn test_channel_reviewer_aborts_run() {
    let mut source = InMemoryTraceSource::new();
    for trial in 1..=3 {
        source.insert("step", TrialKey::new(1, trial), spike_trace(1e-10, &[0.2]));
    }
    let (mut inspector, mut handle) = ChannelInspector::pair(1);
    let run = tokio::task::spawn_blocking(move || {
        let detector = SpikeDetector::new(SpikeParams::default()).unwrap();
        let mut sink = NullSink;
        let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
        BatchRunner::new(&source)
            .run(&detector, "step", &mut ctx)
            .map(|run| (run.status, run.table.len()))
    });

    // accept the first trial, abort on the second
    for text in ["a", "b"] {
        let request = handle.next_request().await.unwrap();
        let answer = request.parse_answer(text).unwrap();
        assert!(handle.answer(answer).await);
    }
    let (status, analyzed) = run.await.unwrap().unwrap();
    assert_eq!(status, BatchStatus::Aborted);
    assert_eq!(analyzed, 1);
}

#[test]
fn test_headless_membrane_run_without_charging_curve() {
    let mut samples = vec![0.0; 20_000];
    for v in samples.iter_mut().skip(1_000).take(4_000) {
        *v = -50e-12;
    }
    let mut source = InMemoryTraceSource::new();
    source.insert("seal", TrialKey::new(3, 1), Trace::new(samples, SR).unwrap());

    let analyzer = MembraneTestAnalyzer::seal_test(SealTestParams::default()).unwrap();
    let mut inspector = HeadlessInspector;
    let mut sink = NullSink;
    let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
    let run = BatchRunner::new(&source).run(&analyzer, "seal", &mut ctx).unwrap();

    assert_eq!(run.status, BatchStatus::Completed);
    assert!(run.table.failures().is_empty());
    let summary = run.table.trial(TrialKey::new(3, 1)).unwrap();
    assert_eq!(summary.status, MembraneFitStatus::Abandoned);
    assert_eq!((summary.rs, summary.cm), (0.0, 0.0));
    assert!(((summary.rin - 1e8) / 1e8).abs() < 1e-9);
}

#[test]
fn test_directory_project_to_firing_rates() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = ProjectManifest::new("rates");
    manifest.cell_types.insert(1, "pyramidal".into());
    let mut source = DirectoryTraceSource::create(dir.path(), manifest).unwrap();
    source.write_trace("step", TrialKey::new(1, 1), &spike_trace(50e-12, &[])).unwrap();
    source.write_trace("step", TrialKey::new(1, 2), &spike_trace(100e-12, &[0.2, 0.4])).unwrap();
    source
        .write_trace("step", TrialKey::new(1, 3), &spike_trace(100e-12, &[0.15, 0.3, 0.45, 0.55]))
        .unwrap();

    let source = DirectoryTraceSource::open(dir.path()).unwrap();
    let detector = SpikeDetector::new(SpikeParams::default()).unwrap();
    let mut inspector = HeadlessInspector;
    let mut sink = NullSink;
    let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
    let run = BatchRunner::new(&source).run(&detector, "step", &mut ctx).unwrap();
    assert_eq!(run.table.len(), 3);

    let cells = select_cells(&run.table.cells(), &source.selected_cells(), None);
    let rates = firing_rates(&run.table, &cells, None, &source.assigned_types());
    assert_eq!(rates.len(), 2);
    assert_eq!(rates[0].rate, 0.0);
    assert!((rates[1].rate - 6.0).abs() < 1e-9);
    assert_eq!(rates[1].trials, 2);
    assert_eq!(rates[1].cell_type.as_deref(), Some("pyramidal"));

    let mut store = ResultStore::new();
    store.insert(StoredTable::Spike(run.table));
    let written = store
        .export_csv(wcp_batch::AnalysisKind::Spike, "step", &dir.path().join("out"))
        .unwrap();
    assert!(written.iter().all(|p| p.exists()));
    assert!(written[0].ends_with("ap_step.csv"));
}
