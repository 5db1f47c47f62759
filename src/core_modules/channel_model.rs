// THEORY:
// The channel model is the validated configuration surface of the engine. It
// is an explicit value threaded into every simulation call; there is no
// process-wide configuration object.
//
// Key principles:
// 1.  **One generic model for every channel count**: grayscale, RGB and
//     spectral (cones + rod) runs differ only in the constants supplied. A
//     constant is either a scalar broadcast to every channel or a vector with
//     one entry per channel.
// 2.  **Validate before simulating**: `SimulationConfig::validate` checks the
//     channel-independent parameters, and `kinetics_for` checks the arity of
//     `ca`/`cd` against the channel count of the run. Both happen before the
//     first integrator step.
// 3.  **Resolved kinetics are immutable**: `ChannelKinetics` holds one `ca`
//     and one `cd` per channel so the integrator never re-checks arity.

use crate::core_modules::retina::FoveaConfig;
use crate::error::{SimulationError, SimulationResult};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CA: f32 = 0.3;
pub const DEFAULT_CD: f32 = 0.3;
pub const DEFAULT_DT: f32 = 0.032;
pub const DEFAULT_ITERATIONS: u32 = 10;
pub const DEFAULT_INTENSITY: f32 = 1.0;
pub const DEFAULT_ALPHA: f32 = 0.5;
pub const DEFAULT_EXPOSURE: f32 = 1.0;

/// Per-class constants of the spectral preset, ordered L, M, S cones then rod.
pub const SPECTRAL_CA: [f32; 4] = [0.2, 0.3, 0.5, 0.4];
pub const SPECTRAL_CD: [f32; 4] = [0.1, 0.15, 0.2, 0.05];
pub const SPECTRAL_DT: f32 = 0.05;
pub const SPECTRAL_ITERATIONS: u32 = 20;
pub const SPECTRAL_INTENSITY: f32 = 2.0;

/// A kinetics constant: one value for all channels, or one per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelConstant {
    Scalar(f32),
    PerChannel(Vec<f32>),
}

impl ChannelConstant {
    /// The number of channels this constant is bound to, if it is a vector.
    pub fn arity(&self) -> Option<usize> {
        match self {
            ChannelConstant::Scalar(_) => None,
            ChannelConstant::PerChannel(values) => Some(values.len()),
        }
    }

    fn values(&self) -> &[f32] {
        match self {
            ChannelConstant::Scalar(value) => std::slice::from_ref(value),
            ChannelConstant::PerChannel(values) => values,
        }
    }

    fn validate(&self, name: &str) -> SimulationResult<()> {
        if let ChannelConstant::PerChannel(values) = self {
            if values.is_empty() {
                return Err(SimulationError::Configuration(format!(
                    "{name} must not be an empty vector"
                )));
            }
        }
        for value in self.values() {
            if !value.is_finite() || *value < 0.0 {
                return Err(SimulationError::Configuration(format!(
                    "{name} values must be finite and >= 0, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Expands the constant to exactly `channels` entries.
    fn resolve(&self, name: &str, channels: usize) -> SimulationResult<Vec<f32>> {
        match self {
            ChannelConstant::Scalar(value) => Ok(vec![*value; channels]),
            ChannelConstant::PerChannel(values) if values.len() == channels => Ok(values.clone()),
            ChannelConstant::PerChannel(values) => Err(SimulationError::Configuration(format!(
                "{name} has {} entries but the run has {channels} channels",
                values.len()
            ))),
        }
    }
}

impl From<f32> for ChannelConstant {
    fn from(value: f32) -> Self {
        ChannelConstant::Scalar(value)
    }
}

impl From<Vec<f32>> for ChannelConstant {
    fn from(values: Vec<f32>) -> Self {
        ChannelConstant::PerChannel(values)
    }
}

impl<const N: usize> From<[f32; N]> for ChannelConstant {
    fn from(values: [f32; N]) -> Self {
        ChannelConstant::PerChannel(values.to_vec())
    }
}

/// Full configuration of a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Bleaching (activation) rate.
    pub ca: ChannelConstant,
    /// Regeneration (deactivation) rate.
    pub cd: ChannelConstant,
    /// Integration step in seconds.
    pub dt: f32,
    /// Integrator applications per frame.
    pub iterations: u32,
    /// Afterimage scale factor.
    pub intensity: f32,
    /// Weight of the current frame in the persistent overlay.
    pub alpha: f32,
    /// Multiplier turning input samples into effective radiance.
    pub exposure: f32,
    /// Optional foveal cone-density modulation of the radiance.
    pub fovea: Option<FoveaConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ca: ChannelConstant::Scalar(DEFAULT_CA),
            cd: ChannelConstant::Scalar(DEFAULT_CD),
            dt: DEFAULT_DT,
            iterations: DEFAULT_ITERATIONS,
            intensity: DEFAULT_INTENSITY,
            alpha: DEFAULT_ALPHA,
            exposure: DEFAULT_EXPOSURE,
            fovea: None,
        }
    }
}

impl SimulationConfig {
    pub fn builder() -> SimulationConfigBuilder {
        SimulationConfigBuilder::default()
    }

    /// Preset for four receptor classes (L, M, S cones and rod), meant to be
    /// paired with `ConeRodExcitation`.
    pub fn spectral() -> Self {
        Self {
            ca: SPECTRAL_CA.into(),
            cd: SPECTRAL_CD.into(),
            dt: SPECTRAL_DT,
            iterations: SPECTRAL_ITERATIONS,
            intensity: SPECTRAL_INTENSITY,
            ..Self::default()
        }
    }

    /// Checks every channel-independent parameter.
    pub fn validate(&self) -> SimulationResult<()> {
        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err(SimulationError::Configuration(format!(
                "dt must be > 0, got {}",
                self.dt
            )));
        }
        self.ca.validate("ca")?;
        self.cd.validate("cd")?;
        if let (Some(ca_len), Some(cd_len)) = (self.ca.arity(), self.cd.arity()) {
            if ca_len != cd_len {
                return Err(SimulationError::Configuration(format!(
                    "ca has {ca_len} entries but cd has {cd_len}"
                )));
            }
        }
        if !self.intensity.is_finite() || self.intensity < 0.0 {
            return Err(SimulationError::Configuration(format!(
                "intensity must be finite and >= 0, got {}",
                self.intensity
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(SimulationError::Configuration(format!(
                "alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }
        if !self.exposure.is_finite() || self.exposure < 0.0 {
            return Err(SimulationError::Configuration(format!(
                "exposure must be finite and >= 0, got {}",
                self.exposure
            )));
        }
        if let Some(fovea) = &self.fovea {
            fovea.validate()?;
        }
        Ok(())
    }

    /// Resolves the per-channel kinetics for a run with `channels` channels.
    pub fn kinetics_for(&self, channels: usize) -> SimulationResult<ChannelKinetics> {
        self.validate()?;
        if channels == 0 {
            return Err(SimulationError::Configuration(
                "a run needs at least one channel".to_string(),
            ));
        }
        Ok(ChannelKinetics {
            ca: self.ca.resolve("ca", channels)?,
            cd: self.cd.resolve("cd", channels)?,
            dt: self.dt,
            iterations: self.iterations,
        })
    }

    /// Loads and validates a configuration from JSON. Missing fields take
    /// their defaults.
    pub fn from_json(json: &str) -> SimulationResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SimulationError::Configuration(format!("JSON parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> SimulationResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SimulationError::Configuration(format!("JSON encode error: {e}")))
    }
}

/// Builds a `SimulationConfig` starting from the defaults.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfigBuilder {
    config: SimulationConfig,
}

impl SimulationConfigBuilder {
    pub fn ca(mut self, ca: impl Into<ChannelConstant>) -> Self {
        self.config.ca = ca.into();
        self
    }

    pub fn cd(mut self, cd: impl Into<ChannelConstant>) -> Self {
        self.config.cd = cd.into();
        self
    }

    pub fn dt(mut self, dt: f32) -> Self {
        self.config.dt = dt;
        self
    }

    pub fn iterations(mut self, iterations: u32) -> Self {
        self.config.iterations = iterations;
        self
    }

    pub fn intensity(mut self, intensity: f32) -> Self {
        self.config.intensity = intensity;
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.config.alpha = alpha;
        self
    }

    pub fn exposure(mut self, exposure: f32) -> Self {
        self.config.exposure = exposure;
        self
    }

    pub fn fovea(mut self, fovea: FoveaConfig) -> Self {
        self.config.fovea = Some(fovea);
        self
    }

    pub fn build(self) -> SimulationResult<SimulationConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Kinetics constants resolved to one value per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelKinetics {
    ca: Vec<f32>,
    cd: Vec<f32>,
    dt: f32,
    iterations: u32,
}

impl ChannelKinetics {
    /// Same constants for every one of `channels` channels.
    pub fn uniform(
        ca: f32,
        cd: f32,
        dt: f32,
        iterations: u32,
        channels: usize,
    ) -> SimulationResult<Self> {
        SimulationConfig {
            ca: ca.into(),
            cd: cd.into(),
            dt,
            iterations,
            ..SimulationConfig::default()
        }
        .kinetics_for(channels)
    }

    pub fn channels(&self) -> usize {
        self.ca.len()
    }

    #[inline]
    pub fn ca(&self, channel: usize) -> f32 {
        self.ca[channel]
    }

    #[inline]
    pub fn cd(&self, channel: usize) -> f32 {
        self.cd[channel]
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = SimulationConfig::default();
        assert_eq!(config.ca, ChannelConstant::Scalar(0.3));
        assert_eq!(config.cd, ChannelConstant::Scalar(0.3));
        assert_eq!(config.dt, 0.032);
        assert_eq!(config.iterations, 10);
        assert_eq!(config.intensity, 1.0);
        assert_eq!(config.alpha, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn scalar_constants_broadcast_to_any_channel_count() {
        let config = SimulationConfig::default();
        for channels in [1, 3, 4, 7] {
            let kinetics = config.kinetics_for(channels).unwrap();
            assert_eq!(kinetics.channels(), channels);
            assert_eq!(kinetics.ca(channels - 1), 0.3);
        }
    }

    #[test]
    fn vector_constants_must_match_channel_count() {
        let config = SimulationConfig::spectral();
        let kinetics = config.kinetics_for(4).unwrap();
        assert_eq!(kinetics.ca(2), 0.5);
        assert_eq!(kinetics.cd(3), 0.05);

        let err = config.kinetics_for(3).unwrap_err();
        assert!(matches!(err, SimulationError::Configuration(_)));
    }

    #[test]
    fn non_positive_dt_is_rejected() {
        for dt in [0.0, -0.01, f32::NAN] {
            let err = SimulationConfig::builder().dt(dt).build().unwrap_err();
            assert!(matches!(err, SimulationError::Configuration(_)), "dt = {dt}");
        }
    }

    #[test]
    fn zero_iterations_is_allowed() {
        let config = SimulationConfig::builder().iterations(0).build().unwrap();
        assert_eq!(config.kinetics_for(1).unwrap().iterations(), 0);
    }

    #[test]
    fn mismatched_ca_cd_vectors_are_rejected() {
        let err = SimulationConfig::builder()
            .ca([0.1f32, 0.2, 0.3])
            .cd([0.1f32, 0.2])
            .build()
            .unwrap_err();
        assert!(matches!(err, SimulationError::Configuration(_)));
    }

    #[test]
    fn out_of_range_output_parameters_are_rejected() {
        assert!(SimulationConfig::builder().alpha(1.5).build().is_err());
        assert!(SimulationConfig::builder().intensity(-1.0).build().is_err());
        assert!(SimulationConfig::builder().exposure(f32::INFINITY).build().is_err());
        assert!(SimulationConfig::builder().ca(-0.1f32).build().is_err());
        assert!(SimulationConfig::builder().cd(Vec::new()).build().is_err());
    }

    #[test]
    fn json_accepts_scalars_vectors_and_missing_fields() {
        let config = SimulationConfig::from_json(r#"{ "ca": [0.2, 0.3, 0.5], "cd": 0.1, "iterations": 5 }"#)
            .unwrap();
        assert_eq!(config.ca, ChannelConstant::PerChannel(vec![0.2, 0.3, 0.5]));
        assert_eq!(config.cd, ChannelConstant::Scalar(0.1));
        assert_eq!(config.iterations, 5);
        assert_eq!(config.dt, DEFAULT_DT);
    }

    #[test]
    fn json_rejects_negative_iterations_and_bad_dt() {
        let err = SimulationConfig::from_json(r#"{ "iterations": -3 }"#).unwrap_err();
        assert!(matches!(err, SimulationError::Configuration(_)));

        let err = SimulationConfig::from_json(r#"{ "dt": 0.0 }"#).unwrap_err();
        assert!(matches!(err, SimulationError::Configuration(_)));
    }

    #[test]
    fn json_survives_a_round_trip_of_the_spectral_preset() {
        let preset = SimulationConfig::spectral();
        let json = preset.to_json().unwrap();
        assert_eq!(SimulationConfig::from_json(&json).unwrap(), preset);
    }
}
