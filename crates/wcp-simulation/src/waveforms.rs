//! Analytic waveforms of spikes, synaptic events and step responses

use serde::{Deserialize, Serialize};
use wcp_core::ClampMode;

/// Piecewise action potential: linear rise, linear fall into an
/// after-hyperpolarization, exponential recovery
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeShape {
    /// Peak above rest, volts
    pub amplitude: f64,
    /// Onset to peak, seconds
    pub rise: f64,
    /// Peak to AHP minimum, seconds
    pub fall: f64,
    /// AHP depth below rest, volts
    pub ahp_depth: f64,
    /// AHP recovery time constant, seconds
    pub recovery_tau: f64,
}

impl Default for SpikeShape {
    fn default() -> Self {
        Self {
            amplitude: 0.1,
            rise: 0.5e-3,
            fall: 1.0e-3,
            ahp_depth: 0.01,
            recovery_tau: 5e-3,
        }
    }
}

impl SpikeShape {
    /// Displacement from rest at `dt` seconds after onset
    pub fn value_at(&self, dt: f64) -> f64 {
        if dt < 0.0 {
            0.0
        } else if dt < self.rise {
            self.amplitude * dt / self.rise
        } else if dt < self.rise + self.fall {
            self.amplitude - (self.amplitude + self.ahp_depth) * (dt - self.rise) / self.fall
        } else {
            -self.ahp_depth * (-(dt - self.rise - self.fall) / self.recovery_tau).exp()
        }
    }
}

/// Spike onsets of a regular train with spike-frequency adaptation.
/// Each interval is `1 + adaptation` times the previous one.
pub fn firing_times(start: f64, duration: f64, rate: f64, adaptation: f64) -> Vec<f64> {
    if rate <= 0.0 || duration <= 0.0 {
        return Vec::new();
    }
    let mut times = Vec::new();
    let mut interval = 1.0 / rate;
    let mut t = start + interval / 2.0;
    while t < start + duration {
        times.push(t);
        interval *= 1.0 + adaptation;
        t += interval;
    }
    times
}

/// Miniature synaptic event with a double-exponential time course
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MiniEvent {
    /// Onset time, seconds
    pub time: f64,
    /// Signed peak amplitude, amperes
    pub amplitude: f64,
    pub rise_tau: f64,
    pub decay_tau: f64,
}

impl MiniEvent {
    /// Event with 0.5 ms rise and 5 ms decay
    pub fn new(time: f64, amplitude: f64) -> Self {
        Self {
            time,
            amplitude,
            rise_tau: 0.5e-3,
            decay_tau: 5e-3,
        }
    }

    pub fn with_kinetics(mut self, rise_tau: f64, decay_tau: f64) -> Self {
        self.rise_tau = rise_tau;
        self.decay_tau = decay_tau;
        self
    }

    /// Current at `dt` seconds after onset; the peak equals `amplitude`
    pub fn value_at(&self, dt: f64) -> f64 {
        if dt < 0.0 {
            return 0.0;
        }
        let (tr, td) = (self.rise_tau, self.decay_tau);
        if (td - tr).abs() < 1e-12 {
            let x = dt / td;
            return self.amplitude * x * (1.0 - x).exp();
        }
        let t_peak = (td / tr).ln() * td * tr / (td - tr);
        let norm = (-t_peak / td).exp() - (-t_peak / tr).exp();
        self.amplitude * ((-dt / td).exp() - (-dt / tr).exp()) / norm
    }
}

/// Passive cell answering a step through an access resistance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub clamp_mode: ClampMode,
    /// Holding current (voltage clamp) or resting potential (current clamp)
    pub baseline: f64,
    /// Step amplitude, volts or amperes
    pub amplitude: f64,
    pub onset: f64,
    pub duration: f64,
    /// Access resistance, ohms
    pub rs: f64,
    /// Input resistance, ohms
    pub rin: f64,
    /// Membrane capacitance, farads
    pub cm: f64,
    /// Fraction of the steady response lost to sag (current clamp)
    pub sag: f64,
    pub sag_tau: f64,
}

impl Default for StepResponse {
    fn default() -> Self {
        Self {
            clamp_mode: ClampMode::Voltage,
            baseline: 0.0,
            amplitude: -0.005,
            onset: 0.05,
            duration: 0.2,
            rs: 10e6,
            rin: 200e6,
            cm: 200e-12,
            sag: 0.0,
            sag_tau: 0.2,
        }
    }
}

impl StepResponse {
    /// Hyperpolarizing current step in current clamp
    pub fn current_clamp() -> Self {
        Self {
            clamp_mode: ClampMode::Current,
            baseline: -0.07,
            amplitude: -25e-12,
            cm: 100e-12,
            ..Self::default()
        }
    }

    /// Charging time constant
    pub fn tau(&self) -> f64 {
        match self.clamp_mode {
            ClampMode::Voltage => self.cm * self.rs * self.rin / (self.rs + self.rin),
            ClampMode::Current => self.cm * self.rin,
        }
    }

    fn sag_factor(&self, dt: f64) -> f64 {
        1.0 - self.sag * (1.0 - (-dt / self.sag_tau).exp())
    }

    /// Recorded value at `dt` seconds after the step onset
    pub fn value_at(&self, dt: f64) -> f64 {
        if dt < 0.0 {
            return self.baseline;
        }
        let tau = self.tau();
        let a = self.amplitude;
        let during = dt < self.duration;
        let after = dt - self.duration;
        match self.clamp_mode {
            ClampMode::Voltage => {
                let steady = a / (self.rs + self.rin);
                let transient = a / self.rs - steady;
                if during {
                    self.baseline + steady + transient * (-dt / tau).exp()
                } else {
                    self.baseline - transient * (-after / tau).exp()
                }
            }
            ClampMode::Current => {
                let charge = |t: f64| a * self.rin * (1.0 - (-t / tau).exp()) * self.sag_factor(t);
                if during {
                    self.baseline + a * self.rs + charge(dt)
                } else {
                    self.baseline + charge(self.duration) * (-after / tau).exp()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spike_shape() {
        let shape = SpikeShape::default();
        assert_eq!(shape.value_at(-1.0), 0.0);
        assert!((shape.value_at(shape.rise) - shape.amplitude).abs() < 1e-12);
        assert!((shape.value_at(shape.rise + shape.fall) + shape.ahp_depth).abs() < 1e-12);
        assert!(shape.value_at(1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mini_peak_is_amplitude() {
        let event = MiniEvent::new(0.0, -20e-12);
        let peak = (0..2000)
            .map(|i| event.value_at(i as f64 * 1e-6))
            .fold(0.0_f64, f64::min);
        assert!((peak + 20e-12).abs() < 1e-14);
    }

    #[test]
    fn test_firing_times_adapt() {
        let times = firing_times(0.1, 0.5, 20.0, 0.1);
        assert!(!times.is_empty());
        assert!(times.iter().all(|&t| t > 0.1 && t < 0.6));
        let first = times[1] - times[0];
        let last = times[times.len() - 1] - times[times.len() - 2];
        assert!(last > first);
        assert!(firing_times(0.1, 0.5, 0.0, 0.1).is_empty());
    }

    #[test]
    fn test_step_response_limits() {
        let step = StepResponse::default();
        let peak = step.value_at(0.0);
        assert!((peak - step.amplitude / step.rs).abs() < 1e-18);
        let steady = step.value_at(step.duration * 0.99);
        assert!((steady - step.amplitude / (step.rs + step.rin)).abs() < 1e-15);
        assert_eq!(step.value_at(-0.01), step.baseline);

        let cc = StepResponse::current_clamp();
        assert!((cc.tau() - 0.02).abs() < 1e-12);
        assert!((cc.value_at(0.0) - (cc.baseline + cc.amplitude * cc.rs)).abs() < 1e-15);
    }
}
