//! Digital filters for patch-clamp traces
//!
//! Band filters are designed as cascaded biquad sections (analog prototype,
//! frequency transform, bilinear transform) and always run forward and
//! backward so the output has no phase lag.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;
use wcp_core::{filter_error, Trace, WcpResult};

/// Default IIR order used throughout the analyzers
pub const DEFAULT_ORDER: usize = 4;
const MAX_ORDER: usize = 8;

/// Analog prototype family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterFamily {
    /// Maximally flat magnitude
    Butterworth,
    /// Maximally flat group delay, phase-normalized
    Bessel,
}

/// Band type of an IIR filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandType {
    Lowpass,
    Highpass,
    Bandpass,
}

/// Band filter configuration. Cutoffs in Hz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub family: FilterFamily,
    pub band: BandType,
    /// Filter order (per pass)
    pub order: usize,
    /// Cutoff for lowpass/highpass (Hz)
    pub cutoff: Option<f64>,
    /// Low cutoff for bandpass (Hz)
    pub low_cutoff: Option<f64>,
    /// High cutoff for bandpass (Hz)
    pub high_cutoff: Option<f64>,
}

impl FilterSpec {
    /// Create lowpass filter configuration
    pub fn lowpass(cutoff: f64) -> Self {
        Self {
            family: FilterFamily::Butterworth,
            band: BandType::Lowpass,
            order: DEFAULT_ORDER,
            cutoff: Some(cutoff),
            low_cutoff: None,
            high_cutoff: None,
        }
    }

    /// Create highpass filter configuration
    pub fn highpass(cutoff: f64) -> Self {
        Self {
            family: FilterFamily::Butterworth,
            band: BandType::Highpass,
            order: DEFAULT_ORDER,
            cutoff: Some(cutoff),
            low_cutoff: None,
            high_cutoff: None,
        }
    }

    /// Create bandpass filter configuration
    pub fn bandpass(low_cutoff: f64, high_cutoff: f64) -> Self {
        Self {
            family: FilterFamily::Butterworth,
            band: BandType::Bandpass,
            order: DEFAULT_ORDER,
            cutoff: None,
            low_cutoff: Some(low_cutoff),
            high_cutoff: Some(high_cutoff),
        }
    }

    pub fn with_family(mut self, family: FilterFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    /// Cutoffs normalized by Nyquist, checked against the sampling rate
    pub fn normalized_cutoffs(&self, sample_rate: f64) -> WcpResult<Vec<f64>> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(filter_error!("sampling rate {} must be positive", sample_rate));
        }
        if self.order == 0 || self.order > MAX_ORDER {
            return Err(filter_error!("order {} outside 1..={}", self.order, MAX_ORDER));
        }

        let nyquist = sample_rate / 2.0;
        let check = |name: &str, value: Option<f64>| -> WcpResult<f64> {
            let f = value.ok_or_else(|| filter_error!("{:?} filter requires {}", self.band, name))?;
            if !f.is_finite() || f <= 0.0 {
                return Err(filter_error!("{} {} Hz must be positive", name, f));
            }
            if f >= nyquist {
                return Err(filter_error!(
                    "{} {} Hz must be below Nyquist frequency {} Hz",
                    name, f, nyquist
                ));
            }
            Ok(f / nyquist)
        };

        match self.band {
            BandType::Lowpass | BandType::Highpass => Ok(vec![check("cutoff", self.cutoff)?]),
            BandType::Bandpass => {
                let low = check("low cutoff", self.low_cutoff)?;
                let high = check("high cutoff", self.high_cutoff)?;
                if high <= low {
                    return Err(filter_error!(
                        "bandpass high cutoff {:?} must exceed low cutoff {:?}",
                        self.high_cutoff, self.low_cutoff
                    ));
                }
                Ok(vec![low, high])
            }
        }
    }
}

/// Single second-order section, transposed direct form II.
/// y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Biquad {
    /// Gain for a constant input
    pub fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    fn response(&self, w: f64) -> Complex64 {
        let z1 = Complex64::from_polar(1.0, -w);
        let z2 = z1 * z1;
        (self.b0 + z1 * self.b1 + z2 * self.b2) / (1.0 + z1 * self.a1 + z2 * self.a2)
    }

    fn process_in_place(&self, data: &mut [f64], mut state: [f64; 2]) {
        for v in data.iter_mut() {
            let x = *v;
            let y = self.b0 * x + state[0];
            state[0] = self.b1 * x - self.a1 * y + state[1];
            state[1] = self.b2 * x - self.a2 * y;
            *v = y;
        }
    }
}

/// Forward-backward IIR filter built from a `FilterSpec`
#[derive(Debug, Clone)]
pub struct ZeroPhaseFilter {
    spec: FilterSpec,
    sample_rate: f64,
    sections: Vec<Biquad>,
}

impl ZeroPhaseFilter {
    /// Design the filter for a sampling rate
    pub fn new(spec: FilterSpec, sample_rate: f64) -> WcpResult<Self> {
        let wn = spec.normalized_cutoffs(sample_rate)?;
        let sections = design_sections(&spec, &wn)?;
        debug!(
            family = ?spec.family,
            band = ?spec.band,
            sections = sections.len(),
            "designed band filter"
        );
        Ok(Self {
            spec,
            sample_rate,
            sections,
        })
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    /// Single-pass magnitude response at a frequency in Hz
    #[cfg(test)]
    fn gain_at(&self, freq: f64) -> f64 {
        let w = 2.0 * PI * freq / self.sample_rate;
        self.sections
            .iter()
            .fold(Complex64::new(1.0, 0.0), |acc, s| acc * s.response(w))
            .norm()
    }

    /// Filter forward and backward with odd-extension padding and
    /// steady-state initial conditions. Output length equals input length.
    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        let n = x.len();
        if n == 0 || self.sections.is_empty() {
            return x.to_vec();
        }

        let padlen = (3 * (2 * self.sections.len() + 1)).min(n - 1);
        let mut ext = Vec::with_capacity(n + 2 * padlen);
        for i in (1..=padlen).rev() {
            ext.push(2.0 * x[0] - x[i]);
        }
        ext.extend_from_slice(x);
        for i in 1..=padlen {
            ext.push(2.0 * x[n - 1] - x[n - 1 - i]);
        }

        let zi = self.steady_state();
        let x0 = ext[0];
        let forward = self.run(ext, &zi, x0);
        let reversed: Vec<f64> = forward.into_iter().rev().collect();
        let y0 = reversed[0];
        let backward = self.run(reversed, &zi, y0);
        backward.into_iter().rev().skip(padlen).take(n).collect()
    }

    /// Per-section state for a unit step, cascaded through the DC gains
    fn steady_state(&self) -> Vec<[f64; 2]> {
        let mut scale = 1.0;
        self.sections
            .iter()
            .map(|s| {
                let g = s.dc_gain();
                let zi = [(g - s.b0) * scale, (s.b2 - s.a2 * g) * scale];
                scale *= g;
                zi
            })
            .collect()
    }

    fn run(&self, mut data: Vec<f64>, zi: &[[f64; 2]], x0: f64) -> Vec<f64> {
        for (section, z) in self.sections.iter().zip(zi) {
            section.process_in_place(&mut data, [z[0] * x0, z[1] * x0]);
        }
        data
    }
}

/// Zero-phase band filter of a sample vector
pub fn band_filter(x: &[f64], sample_rate: f64, spec: &FilterSpec) -> WcpResult<Vec<f64>> {
    Ok(ZeroPhaseFilter::new(spec.clone(), sample_rate)?.apply(x))
}

/// Zero-phase Butterworth lowpass shortcut
pub fn smooth(x: &[f64], sample_rate: f64, cutoff: f64) -> WcpResult<Vec<f64>> {
    band_filter(x, sample_rate, &FilterSpec::lowpass(cutoff))
}

fn butterworth_poles(order: usize) -> Vec<Complex64> {
    let n = order as f64;
    (0..order)
        .map(|k| {
            let m = -n + 1.0 + 2.0 * k as f64;
            -Complex64::from_polar(1.0, PI * m / (2.0 * n))
        })
        .collect()
}

fn factorial(n: usize) -> f64 {
    (1..=n).fold(1.0, |acc, k| acc * k as f64)
}

/// Poles of the reverse Bessel polynomial, scaled so the constant term is 1
/// (phase midpoint at unit angular frequency)
fn bessel_poles(order: usize) -> Vec<Complex64> {
    let n = order;
    let coeffs: Vec<f64> = (0..=n)
        .map(|k| factorial(2 * n - k) / (2f64.powi((n - k) as i32) * factorial(k) * factorial(n - k)))
        .collect();
    let c = coeffs[0].powf(1.0 / n as f64);
    let monic: Vec<f64> = coeffs
        .iter()
        .enumerate()
        .map(|(k, a)| a * c.powi(k as i32) / c.powi(n as i32))
        .collect();
    polynomial_roots(&monic)
}

/// Durand-Kerner iteration. Coefficients ascending, leading coefficient 1.
fn polynomial_roots(coeffs: &[f64]) -> Vec<Complex64> {
    let n = coeffs.len() - 1;
    let eval = |z: Complex64| {
        coeffs
            .iter()
            .rev()
            .fold(Complex64::new(0.0, 0.0), |acc, &c| acc * z + c)
    };

    let seed = Complex64::new(0.4, 0.9);
    let mut roots: Vec<Complex64> = (0..n).map(|k| seed.powu(k as u32)).collect();
    for _ in 0..500 {
        let mut delta: f64 = 0.0;
        for i in 0..n {
            let mut denom = Complex64::new(1.0, 0.0);
            for j in 0..n {
                if i != j {
                    denom *= roots[i] - roots[j];
                }
            }
            let step = eval(roots[i]) / denom;
            roots[i] -= step;
            delta = delta.max(step.norm());
        }
        if delta < 1e-14 {
            break;
        }
    }
    roots
}

fn design_sections(spec: &FilterSpec, wn: &[f64]) -> WcpResult<Vec<Biquad>> {
    let prototype = match spec.family {
        FilterFamily::Butterworth => butterworth_poles(spec.order),
        FilterFamily::Bessel => bessel_poles(spec.order),
    };

    // Bilinear transform runs at fs = 2 on Nyquist-normalized frequencies
    let warp = |w: f64| 4.0 * (PI * w / 2.0).tan();
    let (analog, w_ref) = match spec.band {
        BandType::Lowpass => {
            let wo = warp(wn[0]);
            (prototype.iter().map(|&p| p * wo).collect::<Vec<_>>(), 0.0)
        }
        BandType::Highpass => {
            let wo = warp(wn[0]);
            (prototype.iter().map(|&p| wo / p).collect(), PI)
        }
        BandType::Bandpass => {
            let (wl, wh) = (warp(wn[0]), warp(wn[1]));
            let bw = wh - wl;
            let wo = (wl * wh).sqrt();
            let mut poles = Vec::with_capacity(2 * prototype.len());
            for &p in &prototype {
                let p_lp = p * (bw / 2.0);
                let root = (p_lp * p_lp - wo * wo).sqrt();
                poles.push(p_lp + root);
                poles.push(p_lp - root);
            }
            (poles, 2.0 * (wo / 4.0).atan())
        }
    };

    let digital: Vec<Complex64> = analog.iter().map(|&p| (4.0 + p) / (4.0 - p)).collect();

    let mut denominators: Vec<(f64, f64)> = Vec::new();
    let mut real_poles: Vec<f64> = Vec::new();
    for p in &digital {
        if p.im.abs() <= 1e-9 * p.norm().max(1.0) {
            real_poles.push(p.re);
        } else if p.im > 0.0 {
            denominators.push((-2.0 * p.re, p.norm_sqr()));
        }
    }
    let complex_pairs = denominators.len();
    if 2 * complex_pairs + real_poles.len() != digital.len() {
        return Err(filter_error!(
            "pole design for order {} {:?} produced unpaired poles",
            spec.order, spec.family
        ));
    }
    for pair in real_poles.chunks(2) {
        match pair {
            [p1, p2] => denominators.push((-(p1 + p2), p1 * p2)),
            [p] => denominators.push((-p, 0.0)),
            _ => {}
        }
    }

    let mut sections: Vec<Biquad> = denominators
        .iter()
        .map(|&(a1, a2)| {
            let first_order = a2 == 0.0;
            let (b0, b1, b2) = match (spec.band, first_order) {
                (BandType::Lowpass, false) => (1.0, 2.0, 1.0),
                (BandType::Lowpass, true) => (1.0, 1.0, 0.0),
                (BandType::Highpass, false) => (1.0, -2.0, 1.0),
                (BandType::Highpass, true) => (1.0, -1.0, 0.0),
                (BandType::Bandpass, _) => (1.0, 0.0, -1.0),
            };
            Biquad { b0, b1, b2, a1, a2 }
        })
        .collect();

    let gain = sections
        .iter()
        .fold(Complex64::new(1.0, 0.0), |acc, s| acc * s.response(w_ref))
        .norm();
    if !gain.is_finite() || gain == 0.0 {
        return Err(filter_error!("degenerate filter gain {}", gain));
    }
    if let Some(first) = sections.first_mut() {
        first.b0 /= gain;
        first.b1 /= gain;
        first.b2 /= gain;
    }
    Ok(sections)
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Median filter that only replaces samples deviating from their local median
/// by more than `threshold`. Edge windows shrink to the samples available.
pub fn thresholded_median_filter(x: &[f64], window: usize, threshold: f64) -> WcpResult<Vec<f64>> {
    if window == 0 || window % 2 == 0 {
        return Err(filter_error!("median window {} must be odd", window));
    }
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(filter_error!("median threshold {} must be non-negative", threshold));
    }

    let half = window / 2;
    let mut buf = Vec::with_capacity(window);
    Ok(x.iter()
        .enumerate()
        .map(|(i, &v)| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(x.len());
            buf.clear();
            buf.extend_from_slice(&x[lo..hi]);
            let m = median(&mut buf);
            if (m - v).abs() > threshold {
                m
            } else {
                v
            }
        })
        .collect())
}

/// Subtract the least-squares line through the samples
pub fn remove_linear_trend(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n < 2 {
        let mean = x.iter().sum::<f64>() / n.max(1) as f64;
        return x.iter().map(|v| v - mean).collect();
    }

    let nf = n as f64;
    let t_mean = (nf - 1.0) / 2.0;
    let x_mean = x.iter().sum::<f64>() / nf;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, v) in x.iter().enumerate() {
        let dt = i as f64 - t_mean;
        sxy += dt * (v - x_mean);
        sxx += dt * dt;
    }
    let slope = sxy / sxx;
    x.iter()
        .enumerate()
        .map(|(i, v)| v - (x_mean + slope * (i as f64 - t_mean)))
        .collect()
}

/// First difference scaled to units per second. One sample shorter than input.
pub fn derivative(x: &[f64], sample_rate: f64) -> Vec<f64> {
    x.windows(2).map(|w| (w[1] - w[0]) * sample_rate).collect()
}

/// One conditioning step of a `FilterChain`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterStep {
    ThresholdedMedian { window: usize, threshold: f64 },
    Band { spec: FilterSpec },
}

impl FilterStep {
    pub fn apply(&self, x: &[f64], sample_rate: f64) -> WcpResult<Vec<f64>> {
        match self {
            FilterStep::ThresholdedMedian { window, threshold } => {
                thresholded_median_filter(x, *window, *threshold)
            }
            FilterStep::Band { spec } => band_filter(x, sample_rate, spec),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub step: FilterStep,
    pub enabled: bool,
}

/// Ordered list of conditioning filters, each individually switchable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterChain {
    entries: Vec<ChainEntry>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an enabled step
    pub fn push(&mut self, step: FilterStep) {
        self.entries.push(ChainEntry { step, enabled: true });
    }

    pub fn with_step(mut self, step: FilterStep) -> Self {
        self.push(step);
        self
    }

    pub fn remove(&mut self, index: usize) -> Option<FilterStep> {
        (index < self.entries.len()).then(|| self.entries.remove(index).step)
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> WcpResult<()> {
        let len = self.entries.len();
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| filter_error!("filter index {} out of bounds (len {})", index, len))?;
        entry.enabled = enabled;
        Ok(())
    }

    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.enabled)
    }

    /// Run every enabled step in order
    pub fn apply(&self, x: &[f64], sample_rate: f64) -> WcpResult<Vec<f64>> {
        let mut y = x.to_vec();
        for entry in self.entries.iter().filter(|e| e.enabled) {
            y = entry.step.apply(&y, sample_rate)?;
        }
        Ok(y)
    }

    /// Filter a trace, keeping its sampling rate and stimulus
    pub fn apply_trace(&self, trace: &Trace) -> WcpResult<Trace> {
        if self.is_empty() {
            return Ok(trace.clone());
        }
        debug!(steps = self.entries.len(), "applying filter chain");
        trace.with_samples(self.apply(trace.samples(), trace.sample_rate())?)
    }
}
