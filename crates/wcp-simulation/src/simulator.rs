//! Seeded patch-clamp trace simulator

use crate::waveforms::{firing_times, MiniEvent, SpikeShape, StepResponse};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use wcp_core::{Stimulus, Trace, WcpError, WcpResult};

/// Resting potential of simulated current-clamp recordings, volts
pub const RESTING_POTENTIAL: f64 = -0.07;

/// Configuration shared by every generated trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Sampling rate in Hz
    pub sample_rate: f64,
    /// Trace duration in seconds
    pub duration: f64,
    /// Gaussian noise standard deviation in physical units (0.0 = no noise)
    pub noise_std: f64,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sample_rate: 20_000.0,
            duration: 1.0,
            noise_std: 0.0,
            seed: 42,
        }
    }
}

/// Generator of synthetic recordings
pub struct PatchSimulator {
    config: SimulationConfig,
    rng: rand::rngs::StdRng,
    noise: Normal<f64>,
}

impl PatchSimulator {
    /// Create a simulator; the configuration is checked up front
    pub fn new(config: SimulationConfig) -> WcpResult<Self> {
        if !config.sample_rate.is_finite() || config.sample_rate <= 0.0 {
            return Err(WcpError::InvalidParameter {
                name: "sample_rate".to_string(),
                reason: format!("{} must be positive", config.sample_rate),
            });
        }
        if !config.duration.is_finite() || config.duration <= 0.0 {
            return Err(WcpError::InvalidParameter {
                name: "duration".to_string(),
                reason: format!("{} must be positive", config.duration),
            });
        }
        let noise = Normal::new(0.0, config.noise_std).map_err(|e| WcpError::InvalidParameter {
            name: "noise_std".to_string(),
            reason: format!("Failed to create normal distribution: {}", e),
        })?;

        Ok(PatchSimulator {
            rng: rand::rngs::StdRng::seed_from_u64(config.seed),
            config,
            noise,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    fn sample_count(&self) -> usize {
        (self.config.duration * self.config.sample_rate) as usize
    }

    /// Seconds from the sample nearest to `onset` to sample `i`, so an event
    /// always starts exactly on a sample
    fn since(&self, i: usize, onset: f64) -> f64 {
        let sr = self.config.sample_rate;
        (i as f64 - (onset * sr).round()) / sr
    }

    /// Add Gaussian noise and wrap the samples into a trace
    fn finish(&mut self, mut samples: Vec<f64>) -> WcpResult<Trace> {
        if self.config.noise_std > 0.0 {
            for v in samples.iter_mut() {
                *v += self.noise.sample(&mut self.rng);
            }
        }
        Trace::new(samples, self.config.sample_rate)
    }

    /// Current-clamp recording at rest with spikes at the given onsets
    pub fn spike_train(&mut self, stimulus: Stimulus, onsets: &[f64], shape: &SpikeShape) -> WcpResult<Trace> {
        let samples = (0..self.sample_count())
            .map(|i| {
                RESTING_POTENTIAL + onsets.iter().map(|&t| shape.value_at(self.since(i, t))).sum::<f64>()
            })
            .collect();
        Ok(self.finish(samples)?.with_stimulus(stimulus))
    }

    /// Current step that fires above `rheobase` at `gain` Hz per ampere,
    /// with onset jitter and adaptation
    pub fn current_step(&mut self, stimulus: Stimulus, rheobase: f64, gain: f64) -> WcpResult<Trace> {
        let rate = if stimulus.amplitude > rheobase {
            gain * (stimulus.amplitude - rheobase)
        } else {
            0.0
        };
        let jitter = 0.1e-3;
        let onsets: Vec<f64> = firing_times(stimulus.start, stimulus.duration, rate, 0.05)
            .into_iter()
            .map(|t| t + self.rng.gen_range(-jitter..jitter))
            .collect();
        self.spike_train(stimulus, &onsets, &SpikeShape::default())
    }

    /// Voltage-clamp holding current with miniature events
    pub fn minis(&mut self, events: &[MiniEvent]) -> WcpResult<Trace> {
        let samples = (0..self.sample_count())
            .map(|i| events.iter().map(|e| e.value_at(self.since(i, e.time))).sum())
            .collect();
        self.finish(samples)
    }

    /// Events at Poisson-distributed times with amplitude scatter
    pub fn random_minis(&mut self, rate: f64, amplitude: f64) -> WcpResult<Trace> {
        let mut events = Vec::new();
        if rate > 0.0 {
            let mut t = 0.0;
            loop {
                let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
                t += -u.ln() / rate;
                if t >= self.config.duration {
                    break;
                }
                let scatter = self.rng.gen_range(0.7..1.3);
                events.push(MiniEvent::new(t, amplitude * scatter));
            }
        }
        self.minis(&events)
    }

    /// Passive step response; the step is attached as the stimulus
    pub fn step_response(&mut self, step: &StepResponse) -> WcpResult<Trace> {
        let samples = (0..self.sample_count())
            .map(|i| step.value_at(self.since(i, step.onset)))
            .collect();
        let stimulus = Stimulus::new(step.onset, step.duration, step.amplitude);
        Ok(self.finish(samples)?.with_stimulus(stimulus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulator(noise_std: f64) -> PatchSimulator {
        PatchSimulator::new(SimulationConfig {
            noise_std,
            ..SimulationConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_config() {
        let config = SimulationConfig {
            sample_rate: 0.0,
            ..SimulationConfig::default()
        };
        assert!(PatchSimulator::new(config).is_err());
    }

    #[test]
    fn test_spike_train_resting_level() {
        let mut sim = simulator(0.0);
        let trace = sim
            .spike_train(Stimulus::new(0.1, 0.5, 1e-10), &[0.2], &SpikeShape::default())
            .unwrap();
        assert_eq!(trace.len(), 20_000);
        assert_eq!(trace.samples()[0], RESTING_POTENTIAL);
        let stats = trace.stats();
        assert!((stats.max - (RESTING_POTENTIAL + 0.1)).abs() < 1e-9);
        assert!(trace.stimulus().is_some());
    }

    #[test]
    fn test_same_seed_same_noise() {
        let a = simulator(1e-12).random_minis(5.0, -20e-12).unwrap();
        let b = simulator(1e-12).random_minis(5.0, -20e-12).unwrap();
        assert_eq!(a.samples(), b.samples());
    }

    #[test]
    fn test_current_step_below_rheobase_is_silent() {
        let mut sim = simulator(0.0);
        let trace = sim.current_step(Stimulus::new(0.1, 0.5, 20e-12), 50e-12, 1e12).unwrap();
        assert!(trace.samples().iter().all(|&v| v == RESTING_POTENTIAL));
    }

    #[test]
    fn test_step_response_starts_on_sample() {
        let mut sim = simulator(0.0);
        let step = StepResponse::default();
        let trace = sim.step_response(&step).unwrap();
        let onset = trace.index_at(step.onset);
        assert_eq!(trace.samples()[onset - 1], step.baseline);
        assert!((trace.samples()[onset] - step.amplitude / step.rs).abs() < 1e-18);
    }
}
