//! Current analysis parameters, shared between the UI side and batch runs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use wcp_core::{WcpError, WcpResult};
use wcp_processing::{
    AnalysisConfig, FilterChain, MiniParams, ParamValue, Parameterized, SealTestParams, SpikeParams,
    SubthresholdParams,
};

fn unknown_analyzer(name: &str, analyzer: &str) -> WcpError {
    WcpError::InvalidParameter {
        name: name.to_string(),
        reason: format!("unknown analyzer '{}'", analyzer),
    }
}

/// Holds the configuration used by the next run. Updates are refused while a
/// run is in progress.
#[derive(Debug, Default)]
pub struct ParameterRegistry {
    config: RwLock<AnalysisConfig>,
    busy: Arc<AtomicBool>,
}

/// Marks the registry busy until dropped
#[derive(Debug)]
pub struct RunGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
        debug!("parameter registry released");
    }
}

impl ParameterRegistry {
    pub fn new(config: AnalysisConfig) -> WcpResult<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> AnalysisConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Lock the parameters for the duration of a run
    pub fn begin_run(&self) -> WcpResult<RunGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WcpError::ParametersLocked {
                analyzer: "batch".to_string(),
            });
        }
        Ok(RunGuard {
            busy: Arc::clone(&self.busy),
        })
    }

    /// Apply `change` to a copy of the configuration; the copy replaces the
    /// current one when it validates
    pub fn update<F>(&self, analyzer: &str, change: F) -> WcpResult<()>
    where
        F: FnOnce(&mut AnalysisConfig) -> WcpResult<()>,
    {
        if self.is_busy() {
            warn!(analyzer, "parameter update refused during a run");
            return Err(WcpError::ParametersLocked {
                analyzer: analyzer.to_string(),
            });
        }
        let mut guard = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut updated = guard.clone();
        change(&mut updated)?;
        updated.validate()?;
        *guard = updated;
        Ok(())
    }

    /// Replace the whole configuration
    pub fn replace(&self, config: AnalysisConfig) -> WcpResult<()> {
        self.update("all", move |current| {
            *current = config;
            Ok(())
        })
    }

    /// Set one parameter of one analyzer by name
    pub fn set_value(&self, analyzer: &str, name: &str, value: ParamValue) -> WcpResult<()> {
        self.update(analyzer, |config| match analyzer {
            SpikeParams::NAME => config.spike.set_value(name, value),
            MiniParams::NAME => config.mini.set_value(name, value),
            SealTestParams::NAME => config.seal_test.set_value(name, value),
            SubthresholdParams::NAME => config.subthreshold.set_value(name, value),
            other => Err(unknown_analyzer(name, other)),
        })
    }

    /// Set one parameter from user text, parsed against the analyzer's schema
    pub fn set_text(&self, analyzer: &str, name: &str, text: &str) -> WcpResult<()> {
        let spec = match analyzer {
            SpikeParams::NAME => SpikeParams::spec_of(name)?,
            MiniParams::NAME => MiniParams::spec_of(name)?,
            SealTestParams::NAME => SealTestParams::spec_of(name)?,
            SubthresholdParams::NAME => SubthresholdParams::spec_of(name)?,
            other => return Err(unknown_analyzer(name, other)),
        };
        self.set_value(analyzer, name, ParamValue::parse(name, &spec.kind, text)?)
    }

    /// Apply an `analyzer.parameter=value` assignment
    pub fn assign(&self, assignment: &str) -> WcpResult<()> {
        let malformed = || WcpError::InvalidParameter {
            name: assignment.to_string(),
            reason: "expected analyzer.parameter=value".to_string(),
        };
        let (path, text) = assignment.split_once('=').ok_or_else(malformed)?;
        let (analyzer, name) = path.trim().split_once('.').ok_or_else(malformed)?;
        self.set_text(analyzer, name, text)
    }

    /// Replace the conditioning filter chain
    pub fn set_filters(&self, filters: FilterChain) -> WcpResult<()> {
        self.update("filters", move |config| {
            config.filters = filters;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wcp_processing::{FilterSpec, FilterStep};

    #[test]
    fn test_set_value_by_name() {
        let registry = ParameterRegistry::new(AnalysisConfig::default()).unwrap();
        registry
            .set_value(SpikeParams::NAME, "slope_threshold", ParamValue::from(35.0))
            .unwrap();
        assert_eq!(registry.snapshot().spike.slope_threshold, 35.0);

        assert!(registry
            .set_value("unknown", "slope_threshold", ParamValue::from(1.0))
            .is_err());
    }

    #[test]
    fn test_assignment_from_text() {
        let registry = ParameterRegistry::new(AnalysisConfig::default()).unwrap();
        registry.assign("spike.slope_threshold=35").unwrap();
        registry.assign("mini.polarity = positive").unwrap();
        let config = registry.snapshot();
        assert_eq!(config.spike.slope_threshold, 35.0);
        assert_eq!(config.mini.polarity, wcp_processing::Polarity::Positive);

        assert!(registry.assign("spike.slope_threshold").is_err());
        assert!(registry.assign("slope_threshold=35").is_err());
        assert!(registry.assign("spike.slope_threshold=fast").is_err());
        assert!(registry.assign("spike.no_such_parameter=1").is_err());
        assert_eq!(registry.snapshot(), config);
    }

    #[test]
    fn test_invalid_value_keeps_config() {
        let registry = ParameterRegistry::new(AnalysisConfig::default()).unwrap();
        let before = registry.snapshot();
        assert!(registry
            .set_value(MiniParams::NAME, "min_tau", ParamValue::from(-1.0))
            .is_err());
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn test_updates_locked_during_run() {
        let registry = ParameterRegistry::new(AnalysisConfig::default()).unwrap();
        let guard = registry.begin_run().unwrap();
        assert!(registry.is_busy());
        assert!(matches!(registry.begin_run(), Err(WcpError::ParametersLocked { .. })));

        let filters = FilterChain::new().with_step(FilterStep::Band {
            spec: FilterSpec::lowpass(1_000.0),
        });
        match registry.set_filters(filters.clone()) {
            Err(WcpError::ParametersLocked { analyzer }) => assert_eq!(analyzer, "filters"),
            other => panic!("expected ParametersLocked, got {:?}", other),
        }

        drop(guard);
        assert!(!registry.is_busy());
        registry.set_filters(filters.clone()).unwrap();
        assert_eq!(registry.snapshot().filters, filters);
    }
}
