//! Detection parameters, presets and the generic parameter schema

use crate::filters::FilterChain;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use wcp_core::{ClampMode, WcpError, WcpResult};

/// Direction of the events of interest. Negative flips the trace first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn factor(self) -> f64 {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }

    /// Polarity of a signed value, zero counts as positive
    pub fn of(value: f64) -> Self {
        if value < 0.0 {
            Polarity::Negative
        } else {
            Polarity::Positive
        }
    }
}

/// Kind of a parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamKind {
    Int,
    Float,
    IntRange,
    FloatRange,
    IntList,
    FloatList,
    StringList,
    Bool,
    Enum(Vec<String>),
}

/// Tagged parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    IntRange([i64; 2]),
    FloatRange([f64; 2]),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    StringList(Vec<String>),
    Bool(bool),
    Enum(String),
}

/// Name, kind and description of one parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
}

impl ParamSpec {
    fn new(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self { name, kind, description }
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> WcpError {
    WcpError::InvalidParameter {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn serialization(e: serde_json::Error) -> WcpError {
    WcpError::Serialization { reason: e.to_string() }
}

impl ParamValue {
    /// Whether the value fits a kind. Integers are accepted for float kinds.
    pub fn matches(&self, kind: &ParamKind) -> bool {
        match (self, kind) {
            (ParamValue::Int(_), ParamKind::Int | ParamKind::Float) => true,
            (ParamValue::Float(_), ParamKind::Float) => true,
            (ParamValue::IntRange(_), ParamKind::IntRange | ParamKind::FloatRange) => true,
            (ParamValue::FloatRange(_), ParamKind::FloatRange) => true,
            (ParamValue::IntList(_), ParamKind::IntList | ParamKind::FloatList) => true,
            (ParamValue::FloatList(_), ParamKind::FloatList) => true,
            (ParamValue::StringList(_), ParamKind::StringList) => true,
            (ParamValue::Bool(_), ParamKind::Bool) => true,
            (ParamValue::Enum(v), ParamKind::Enum(options)) => options.contains(v),
            _ => false,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            ParamValue::Int(v) => json!(v),
            ParamValue::Float(v) => json!(v),
            ParamValue::IntRange(v) => json!(v),
            ParamValue::FloatRange(v) => json!(v),
            ParamValue::IntList(v) => json!(v),
            ParamValue::FloatList(v) => json!(v),
            ParamValue::StringList(v) => json!(v),
            ParamValue::Bool(v) => json!(v),
            ParamValue::Enum(v) => json!(v),
        }
    }

    /// Read a JSON value as the given kind
    pub fn from_json(name: &str, kind: &ParamKind, value: &serde_json::Value) -> WcpResult<Self> {
        let parsed = match kind {
            ParamKind::Int => value.as_i64().map(ParamValue::Int),
            ParamKind::Float => value.as_f64().map(ParamValue::Float),
            ParamKind::Bool => value.as_bool().map(ParamValue::Bool),
            ParamKind::Enum(options) => value
                .as_str()
                .filter(|s| options.iter().any(|o| o == s))
                .map(|s| ParamValue::Enum(s.to_string())),
            ParamKind::IntRange => serde_json::from_value(value.clone()).ok().map(ParamValue::IntRange),
            ParamKind::FloatRange => {
                serde_json::from_value(value.clone()).ok().map(ParamValue::FloatRange)
            }
            ParamKind::IntList => serde_json::from_value(value.clone()).ok().map(ParamValue::IntList),
            ParamKind::FloatList => {
                serde_json::from_value(value.clone()).ok().map(ParamValue::FloatList)
            }
            ParamKind::StringList => {
                serde_json::from_value(value.clone()).ok().map(ParamValue::StringList)
            }
        };
        parsed.ok_or_else(|| invalid(name, format!("{} is not a {:?}", value, kind)))
    }

    /// Parse user text such as `25`, `0.1,0.3`, `true` or `negative`
    pub fn parse(name: &str, kind: &ParamKind, text: &str) -> WcpResult<Self> {
        let text = text.trim();
        let items = || text.split(',').map(str::trim).filter(|s| !s.is_empty());
        let bad = || invalid(name, format!("cannot read '{}' as {:?}", text, kind));

        let value = match kind {
            ParamKind::Int => ParamValue::Int(text.parse().map_err(|_| bad())?),
            ParamKind::Float => ParamValue::Float(text.parse().map_err(|_| bad())?),
            ParamKind::Bool => ParamValue::Bool(text.parse().map_err(|_| bad())?),
            ParamKind::Enum(options) => {
                if !options.iter().any(|o| o == text) {
                    return Err(invalid(name, format!("'{}' not one of {:?}", text, options)));
                }
                ParamValue::Enum(text.to_string())
            }
            ParamKind::IntList => ParamValue::IntList(
                items().map(|s| s.parse().map_err(|_| bad())).collect::<WcpResult<_>>()?,
            ),
            ParamKind::FloatList => ParamValue::FloatList(
                items().map(|s| s.parse().map_err(|_| bad())).collect::<WcpResult<_>>()?,
            ),
            ParamKind::StringList => ParamValue::StringList(items().map(String::from).collect()),
            ParamKind::IntRange => {
                let v: Vec<i64> = items().map(|s| s.parse().map_err(|_| bad())).collect::<WcpResult<_>>()?;
                match v.as_slice() {
                    [lo, hi] => ParamValue::IntRange([*lo, *hi]),
                    _ => return Err(invalid(name, "range needs exactly two values")),
                }
            }
            ParamKind::FloatRange => {
                let v: Vec<f64> = items().map(|s| s.parse().map_err(|_| bad())).collect::<WcpResult<_>>()?;
                match v.as_slice() {
                    [lo, hi] => ParamValue::FloatRange([*lo, *hi]),
                    _ => return Err(invalid(name, "range needs exactly two values")),
                }
            }
        };
        Ok(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<[f64; 2]> for ParamValue {
    fn from(value: [f64; 2]) -> Self {
        ParamValue::FloatRange(value)
    }
}

impl From<Vec<i64>> for ParamValue {
    fn from(value: Vec<i64>) -> Self {
        ParamValue::IntList(value)
    }
}

/// Parameter record with a schema, validation and generic access by name
pub trait Parameterized: Serialize + DeserializeOwned + Clone {
    /// Analyzer name used in registries and messages
    const NAME: &'static str;

    fn schema() -> Vec<ParamSpec>;

    fn validate(&self) -> WcpResult<()>;

    fn spec_of(name: &str) -> WcpResult<ParamSpec> {
        Self::schema()
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| invalid(name, format!("unknown parameter of {}", Self::NAME)))
    }

    fn get_value(&self, name: &str) -> WcpResult<ParamValue> {
        let spec = Self::spec_of(name)?;
        let json = serde_json::to_value(self).map_err(serialization)?;
        let field = json
            .get(name)
            .ok_or_else(|| invalid(name, "field missing from serialized parameters"))?;
        ParamValue::from_json(name, &spec.kind, field)
    }

    /// Replace one parameter. The record is unchanged when the new value
    /// does not match the schema or breaks validation.
    fn set_value(&mut self, name: &str, value: ParamValue) -> WcpResult<()> {
        let spec = Self::spec_of(name)?;
        if !value.matches(&spec.kind) {
            return Err(invalid(name, format!("{:?} does not match {:?}", value, spec.kind)));
        }
        let mut json = serde_json::to_value(&*self).map_err(serialization)?;
        json[name] = value.to_json();
        let updated: Self =
            serde_json::from_value(json).map_err(|e| invalid(name, e.to_string()))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn require(name: &str, ok: bool, reason: &str) -> WcpResult<()> {
    if ok {
        Ok(())
    } else {
        Err(invalid(name, reason))
    }
}

fn positive(name: &str, v: f64) -> WcpResult<()> {
    require(name, v.is_finite() && v > 0.0, "must be positive")
}

fn non_negative(name: &str, v: f64) -> WcpResult<()> {
    require(name, v.is_finite() && v >= 0.0, "must be non-negative")
}

fn ordered(name: &str, lo: f64, hi: f64) -> WcpResult<()> {
    require(name, lo.is_finite() && hi.is_finite() && lo < hi, "window start must precede its end")
}

fn polarity_kind() -> ParamKind {
    ParamKind::Enum(vec!["positive".into(), "negative".into()])
}

fn clamp_kind() -> ParamKind {
    ParamKind::Enum(vec!["Voltage".into(), "Current".into()])
}

/// Action potential detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeParams {
    /// Minimum rise slope at onset, units per second
    pub slope_threshold: f64,
    /// Minimum onset-to-peak amplitude
    pub peak_threshold: f64,
    /// Maximum onset-to-peak duration in seconds
    pub half_width_threshold: f64,
    pub polarity: Polarity,
    /// mAHP window start after onset, seconds
    pub mahp_begin: f64,
    /// mAHP window end after onset, seconds
    pub mahp_end: f64,
    /// Pre-stimulus baseline length for sAHP, seconds
    pub baseline: f64,
    /// sAHP window start after stimulus end, seconds
    pub sahp_begin: f64,
    /// sAHP window end after stimulus end, seconds
    pub sahp_end: f64,
    /// Window bounding the last spike of a train, seconds
    pub last_spike_window: f64,
}

impl Default for SpikeParams {
    fn default() -> Self {
        Self {
            slope_threshold: 20.0,
            peak_threshold: 0.02,
            half_width_threshold: 0.004,
            polarity: Polarity::Positive,
            mahp_begin: 0.01,
            mahp_end: 0.2,
            baseline: 0.1,
            sahp_begin: 0.2,
            sahp_end: 0.5,
            last_spike_window: 0.01,
        }
    }
}

impl Parameterized for SpikeParams {
    const NAME: &'static str = "spike";

    fn schema() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("slope_threshold", ParamKind::Float, "minimum onset slope (units/s)"),
            ParamSpec::new("peak_threshold", ParamKind::Float, "minimum onset-to-peak amplitude"),
            ParamSpec::new("half_width_threshold", ParamKind::Float, "maximum onset-to-peak time (s)"),
            ParamSpec::new("polarity", polarity_kind(), "spike direction"),
            ParamSpec::new("mahp_begin", ParamKind::Float, "mAHP window start after onset (s)"),
            ParamSpec::new("mahp_end", ParamKind::Float, "mAHP window end after onset (s)"),
            ParamSpec::new("baseline", ParamKind::Float, "pre-stimulus baseline length (s)"),
            ParamSpec::new("sahp_begin", ParamKind::Float, "sAHP window start after stimulus (s)"),
            ParamSpec::new("sahp_end", ParamKind::Float, "sAHP window end after stimulus (s)"),
            ParamSpec::new("last_spike_window", ParamKind::Float, "window bounding the last spike (s)"),
        ]
    }

    fn validate(&self) -> WcpResult<()> {
        require("slope_threshold", self.slope_threshold.is_finite(), "must be finite")?;
        require("peak_threshold", self.peak_threshold.is_finite(), "must be finite")?;
        positive("half_width_threshold", self.half_width_threshold)?;
        non_negative("mahp_begin", self.mahp_begin)?;
        ordered("mahp_end", self.mahp_begin, self.mahp_end)?;
        positive("baseline", self.baseline)?;
        non_negative("sahp_begin", self.sahp_begin)?;
        ordered("sahp_end", self.sahp_begin, self.sahp_end)?;
        positive("last_spike_window", self.last_spike_window)
    }
}

/// Miniature event detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiniParams {
    pub polarity: Polarity,
    pub median_window: usize,
    /// Glitch threshold of the median prefilter, physical units
    pub median_threshold: f64,
    /// Lowpass cutoff in Hz
    pub low_band_width: f64,
    /// Rise slope threshold, physical units per second
    pub rise_slope: f64,
    /// Maximum rise-to-peak time, seconds
    pub rise_time: f64,
    /// Baseline window before a rise, seconds
    pub baseline_window: f64,
    /// Minimum amplitude, physical units
    pub min_amp: f64,
    /// Minimum decay time constant, seconds
    pub min_tau: f64,
    /// Maximum fit residual norm, scaled units
    pub residual: f64,
    /// Initial rise time constant, samples
    pub on_tau_ini: f64,
    /// Initial decay time constant, samples
    pub off_tau_ini: f64,
    /// Peaks closer than this are stacked, seconds
    pub stack_win: f64,
    /// Scale applied before filtering and fitting
    pub scale: f64,
    /// Analysis window in seconds; equal bounds select the whole trace
    pub window: [f64; 2],
}

impl Default for MiniParams {
    fn default() -> Self {
        Self {
            polarity: Polarity::Negative,
            median_window: 5,
            median_threshold: 30e-12,
            low_band_width: 300.0,
            rise_slope: 4.5e-9,
            rise_time: 5e-3,
            baseline_window: 10e-3,
            min_amp: 1e-11,
            min_tau: 1.2e-3,
            residual: 0.2,
            on_tau_ini: 1.0,
            off_tau_ini: 20.0,
            stack_win: 7e-3,
            scale: 1e12,
            window: [0.0, 0.0],
        }
    }
}

impl Parameterized for MiniParams {
    const NAME: &'static str = "mini";

    fn schema() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("polarity", polarity_kind(), "event direction"),
            ParamSpec::new("median_window", ParamKind::Int, "median prefilter window (odd)"),
            ParamSpec::new("median_threshold", ParamKind::Float, "median prefilter threshold"),
            ParamSpec::new("low_band_width", ParamKind::Float, "lowpass cutoff (Hz)"),
            ParamSpec::new("rise_slope", ParamKind::Float, "rise slope threshold (units/s)"),
            ParamSpec::new("rise_time", ParamKind::Float, "maximum rise time (s)"),
            ParamSpec::new("baseline_window", ParamKind::Float, "baseline window (s)"),
            ParamSpec::new("min_amp", ParamKind::Float, "minimum amplitude"),
            ParamSpec::new("min_tau", ParamKind::Float, "minimum decay tau (s)"),
            ParamSpec::new("residual", ParamKind::Float, "maximum fit residual"),
            ParamSpec::new("on_tau_ini", ParamKind::Float, "initial rise tau (samples)"),
            ParamSpec::new("off_tau_ini", ParamKind::Float, "initial decay tau (samples)"),
            ParamSpec::new("stack_win", ParamKind::Float, "peak stacking window (s)"),
            ParamSpec::new("scale", ParamKind::Float, "amplitude scale for fitting"),
            ParamSpec::new("window", ParamKind::FloatRange, "analysis window (s)"),
        ]
    }

    fn validate(&self) -> WcpResult<()> {
        require("median_window", self.median_window % 2 == 1, "must be odd")?;
        non_negative("median_threshold", self.median_threshold)?;
        positive("low_band_width", self.low_band_width)?;
        require("rise_slope", self.rise_slope.is_finite(), "must be finite")?;
        positive("rise_time", self.rise_time)?;
        positive("baseline_window", self.baseline_window)?;
        require("min_amp", self.min_amp.is_finite(), "must be finite")?;
        non_negative("min_tau", self.min_tau)?;
        positive("residual", self.residual)?;
        positive("on_tau_ini", self.on_tau_ini)?;
        positive("off_tau_ini", self.off_tau_ini)?;
        non_negative("stack_win", self.stack_win)?;
        positive("scale", self.scale)?;
        let [lo, hi] = self.window;
        require(
            "window",
            lo.is_finite() && hi.is_finite() && lo >= 0.0 && lo <= hi,
            "window start must not exceed its end",
        )
    }
}

/// Seal test parameters, windows in absolute seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealTestParams {
    pub baseline_start: f64,
    pub baseline_end: f64,
    pub steady_state_start: f64,
    pub steady_state_end: f64,
    /// Onset of the test step
    pub seal_test_start: f64,
    pub fit_end: f64,
    /// Scale for voltage-clamp (current) traces
    pub scale_v: f64,
    /// Scale for current-clamp (voltage) traces
    pub scale_i: f64,
    /// Command step in voltage clamp, volts
    pub amp_v: f64,
    /// Injected step in current clamp, amperes
    pub amp_i: f64,
    pub min_tau: f64,
    pub clamp_mode: ClampMode,
    /// Series resistance and capacitance already compensated
    pub compensated: bool,
}

impl Default for SealTestParams {
    fn default() -> Self {
        Self {
            baseline_start: 0.04,
            baseline_end: 0.045,
            steady_state_start: 0.15,
            steady_state_end: 0.2,
            seal_test_start: 0.05,
            fit_end: 0.15,
            scale_v: 1e12,
            scale_i: 1e3,
            amp_v: -0.005,
            amp_i: -25e-12,
            min_tau: 1e-3,
            clamp_mode: ClampMode::Voltage,
            compensated: false,
        }
    }
}

impl SealTestParams {
    /// Step amplitude and fit scale for the configured clamp mode
    pub fn step(&self) -> (f64, f64) {
        match self.clamp_mode {
            ClampMode::Voltage => (self.amp_v, self.scale_v),
            ClampMode::Current => (self.amp_i, self.scale_i),
        }
    }
}

impl Parameterized for SealTestParams {
    const NAME: &'static str = "seal_test";

    fn schema() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("baseline_start", ParamKind::Float, "baseline window start (s)"),
            ParamSpec::new("baseline_end", ParamKind::Float, "baseline window end (s)"),
            ParamSpec::new("steady_state_start", ParamKind::Float, "steady-state window start (s)"),
            ParamSpec::new("steady_state_end", ParamKind::Float, "steady-state window end (s)"),
            ParamSpec::new("seal_test_start", ParamKind::Float, "test step onset (s)"),
            ParamSpec::new("fit_end", ParamKind::Float, "fit window end (s)"),
            ParamSpec::new("scale_v", ParamKind::Float, "voltage-clamp fit scale"),
            ParamSpec::new("scale_i", ParamKind::Float, "current-clamp fit scale"),
            ParamSpec::new("amp_v", ParamKind::Float, "voltage step (V)"),
            ParamSpec::new("amp_i", ParamKind::Float, "current step (A)"),
            ParamSpec::new("min_tau", ParamKind::Float, "minimum accepted tau (s)"),
            ParamSpec::new("clamp_mode", clamp_kind(), "amplifier mode"),
            ParamSpec::new("compensated", ParamKind::Bool, "Rs/Cm compensated upstream"),
        ]
    }

    fn validate(&self) -> WcpResult<()> {
        non_negative("baseline_start", self.baseline_start)?;
        ordered("baseline_end", self.baseline_start, self.baseline_end)?;
        ordered("steady_state_end", self.steady_state_start, self.steady_state_end)?;
        non_negative("seal_test_start", self.seal_test_start)?;
        ordered("fit_end", self.seal_test_start, self.fit_end)?;
        require(
            "steady_state_start",
            self.seal_test_start < self.steady_state_start,
            "steady state must follow the test step",
        )?;
        positive("scale_v", self.scale_v)?;
        positive("scale_i", self.scale_i)?;
        require("amp_v", self.amp_v.is_finite() && self.amp_v != 0.0, "must be non-zero")?;
        require("amp_i", self.amp_i.is_finite() && self.amp_i != 0.0, "must be non-zero")?;
        non_negative("min_tau", self.min_tau)
    }
}

/// Subthreshold step parameters, windows relative to stimulus onset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubthresholdParams {
    pub baseline_start: f64,
    pub baseline_end: f64,
    pub steady_state_start: f64,
    pub steady_state_end: f64,
    pub fit_start: f64,
    pub fit_end: f64,
    pub scale_v: f64,
    pub scale_i: f64,
    pub min_tau: f64,
    pub clamp_mode: ClampMode,
    pub compensated: bool,
    /// Median prefilter window applied before analysis
    pub prefilter_window: usize,
    /// Median prefilter threshold applied before analysis
    pub prefilter_threshold: f64,
}

impl Default for SubthresholdParams {
    fn default() -> Self {
        Self {
            baseline_start: -0.05,
            baseline_end: -0.005,
            steady_state_start: 0.6,
            steady_state_end: 0.605,
            fit_start: 0.0002,
            fit_end: 0.007,
            scale_v: 1e12,
            scale_i: 1e3,
            min_tau: 1e-3,
            clamp_mode: ClampMode::Voltage,
            compensated: false,
            prefilter_window: 5,
            prefilter_threshold: 5e-10,
        }
    }
}

impl SubthresholdParams {
    pub fn scale(&self) -> f64 {
        match self.clamp_mode {
            ClampMode::Voltage => self.scale_v,
            ClampMode::Current => self.scale_i,
        }
    }
}

impl Parameterized for SubthresholdParams {
    const NAME: &'static str = "subthreshold";

    fn schema() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("baseline_start", ParamKind::Float, "baseline start from stimulus (s)"),
            ParamSpec::new("baseline_end", ParamKind::Float, "baseline end from stimulus (s)"),
            ParamSpec::new("steady_state_start", ParamKind::Float, "steady-state start from stimulus (s)"),
            ParamSpec::new("steady_state_end", ParamKind::Float, "steady-state end from stimulus (s)"),
            ParamSpec::new("fit_start", ParamKind::Float, "fit start from stimulus (s)"),
            ParamSpec::new("fit_end", ParamKind::Float, "fit end from stimulus (s)"),
            ParamSpec::new("scale_v", ParamKind::Float, "voltage-clamp fit scale"),
            ParamSpec::new("scale_i", ParamKind::Float, "current-clamp fit scale"),
            ParamSpec::new("min_tau", ParamKind::Float, "minimum accepted tau (s)"),
            ParamSpec::new("clamp_mode", clamp_kind(), "amplifier mode"),
            ParamSpec::new("compensated", ParamKind::Bool, "Rs/Cm compensated upstream"),
            ParamSpec::new("prefilter_window", ParamKind::Int, "median prefilter window (odd)"),
            ParamSpec::new("prefilter_threshold", ParamKind::Float, "median prefilter threshold"),
        ]
    }

    fn validate(&self) -> WcpResult<()> {
        ordered("baseline_end", self.baseline_start, self.baseline_end)?;
        ordered("steady_state_end", self.steady_state_start, self.steady_state_end)?;
        ordered("fit_end", self.fit_start, self.fit_end)?;
        require(
            "steady_state_start",
            self.fit_end <= self.steady_state_start,
            "steady state must follow the fit window",
        )?;
        positive("scale_v", self.scale_v)?;
        positive("scale_i", self.scale_i)?;
        non_negative("min_tau", self.min_tau)?;
        require("prefilter_window", self.prefilter_window % 2 == 1, "must be odd")?;
        non_negative("prefilter_threshold", self.prefilter_threshold)
    }
}

/// Complete analysis configuration: one parameter record per analyzer
/// plus the conditioning filter chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub name: String,
    pub spike: SpikeParams,
    pub mini: MiniParams,
    pub seal_test: SealTestParams,
    pub subthreshold: SubthresholdParams,
    pub filters: FilterChain,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            spike: SpikeParams::default(),
            mini: MiniParams::default(),
            seal_test: SealTestParams::default(),
            subthreshold: SubthresholdParams::default(),
            filters: FilterChain::new(),
        }
    }
}

impl AnalysisConfig {
    /// Current-clamp preset: spike and subthreshold analyzers in current clamp
    pub fn current_clamp() -> Self {
        let mut config = Self {
            name: "current clamp".to_string(),
            ..Self::default()
        };
        config.seal_test.clamp_mode = ClampMode::Current;
        config.subthreshold.clamp_mode = ClampMode::Current;
        config
    }

    /// Validate every parameter record
    pub fn validate(&self) -> WcpResult<()> {
        self.spike.validate()?;
        self.mini.validate()?;
        self.seal_test.validate()?;
        self.subthreshold.validate()
    }

    /// Export configuration to JSON
    pub fn to_json(&self) -> WcpResult<String> {
        serde_json::to_string_pretty(self).map_err(serialization)
    }

    /// Import configuration from JSON
    pub fn from_json(json: &str) -> WcpResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(serialization)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{FilterSpec, FilterStep};

    #[test]
    fn test_defaults_validate() {
        assert!(AnalysisConfig::default().validate().is_ok());
        assert!(AnalysisConfig::current_clamp().validate().is_ok());
    }

    #[test]
    fn test_config_json_round_trip() {
        let mut config = AnalysisConfig::current_clamp();
        config.filters.push(FilterStep::Band { spec: FilterSpec::lowpass(2_000.0) });
        config.mini.window = [1.0, 5.0];
        let json = config.to_json().unwrap();
        let back = AnalysisConfig::from_json(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = AnalysisConfig::from_json(r#"{"spike": {"slope_threshold": 35.0}}"#).unwrap();
        assert_eq!(config.spike.slope_threshold, 35.0);
        assert_eq!(config.spike.peak_threshold, 0.02);
        assert_eq!(config.mini, MiniParams::default());
    }

    #[test]
    fn test_set_value_by_name() {
        let mut params = MiniParams::default();
        params.set_value("min_amp", ParamValue::Float(2e-11)).unwrap();
        assert_eq!(params.min_amp, 2e-11);
        params.set_value("median_window", ParamValue::Int(7)).unwrap();
        assert_eq!(params.median_window, 7);
        params.set_value("polarity", ParamValue::Enum("positive".into())).unwrap();
        assert_eq!(params.polarity, Polarity::Positive);
        assert_eq!(params.get_value("window").unwrap(), ParamValue::FloatRange([0.0, 0.0]));
    }

    #[test]
    fn test_set_value_rejects_mismatch() {
        let mut params = MiniParams::default();
        let before = params.clone();
        assert!(matches!(
            params.set_value("min_amp", ParamValue::Bool(true)),
            Err(WcpError::InvalidParameter { .. })
        ));
        assert!(params.set_value("median_window", ParamValue::Int(4)).is_err());
        assert!(params.set_value("no_such_field", ParamValue::Int(1)).is_err());
        assert!(params.set_value("polarity", ParamValue::Enum("sideways".into())).is_err());
        assert_eq!(params, before);
    }

    #[test]
    fn test_parse_text_values() {
        let kind = ParamKind::FloatRange;
        assert_eq!(
            ParamValue::parse("rate", &kind, "0.5, 20").unwrap(),
            ParamValue::FloatRange([0.5, 20.0])
        );
        assert!(ParamValue::parse("rate", &kind, "1").is_err());
        assert_eq!(
            ParamValue::parse("cells", &ParamKind::IntList, "1,2,3").unwrap(),
            ParamValue::IntList(vec![1, 2, 3])
        );
        assert!(ParamValue::parse("n", &ParamKind::Int, "x").is_err());
    }

    #[test]
    fn test_seal_test_step() {
        let mut params = SealTestParams::default();
        assert_eq!(params.step(), (-0.005, 1e12));
        params.set_value("clamp_mode", ParamValue::Enum("Current".into())).unwrap();
        assert_eq!(params.step(), (-25e-12, 1e3));
    }
}
