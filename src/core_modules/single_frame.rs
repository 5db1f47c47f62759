// THEORY:
// The single-frame simulator is the stateless case: a fresh, fully sensitive
// opsin state is exposed to one static radiance map for `iterations` steps.
// Nothing survives between calls, so identical inputs always give
// bit-identical outputs, and independent frames may be simulated in any order
// or in parallel (see `parallel_pipeline`).

use crate::core_modules::afterimage::compose;
use crate::core_modules::channel_model::{ChannelKinetics, SimulationConfig};
use crate::core_modules::excitation::{ExcitationAdapter, PassThrough};
use crate::core_modules::kinetics::{check_compatible, integrate};
use crate::core_modules::retina::Retina;
use crate::core_modules::tensor::{AfterimageFrame, OpsinState, RadianceMap, Tensor};
use crate::error::SimulationResult;
use std::sync::Arc;

/// Final opsin state after `kinetics.iterations()` steps from all ones.
pub fn simulate(radiance: &RadianceMap, kinetics: &ChannelKinetics) -> SimulationResult<OpsinState> {
    let mut state = Tensor::ones(radiance.shape());
    check_compatible(&state, radiance, kinetics)?;
    integrate(&mut state, radiance, kinetics);
    Ok(state)
}

/// Result of simulating one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleFrameOutput {
    pub opsin: OpsinState,
    pub afterimage: AfterimageFrame,
}

/// Runs frames through the retina and a fresh opsin state, one at a time.
#[derive(Debug, Clone)]
pub struct SingleFrameSimulator {
    config: SimulationConfig,
    retina: Retina,
}

impl SingleFrameSimulator {
    pub fn new(config: SimulationConfig) -> SimulationResult<Self> {
        Self::with_adapter(config, Arc::new(PassThrough))
    }

    pub fn with_adapter(
        config: SimulationConfig,
        adapter: Arc<dyn ExcitationAdapter>,
    ) -> SimulationResult<Self> {
        config.validate()?;
        let retina = Retina::new(&config, adapter);
        Ok(Self { config, retina })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn run(&self, frame: &Tensor) -> SimulationResult<SingleFrameOutput> {
        let radiance = self.retina.radiance(frame)?;
        let kinetics = self.config.kinetics_for(radiance.channels())?;
        let opsin = simulate(&radiance, &kinetics)?;
        let afterimage = compose(&opsin, self.config.intensity);
        Ok(SingleFrameOutput { opsin, afterimage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::excitation::ConeRodExcitation;
    use crate::core_modules::tensor::FrameShape;
    use crate::error::SimulationError;
    use approx::assert_relative_eq;

    /// Closed form of `n` Euler steps under constant radiance, from 1.0.
    fn euler_closed_form(ca: f64, cd: f64, dt: f64, radiance: f64, n: i32) -> f64 {
        let target = ca * radiance / (ca * radiance + cd);
        target + (1.0 - target) * (1.0 - dt * (ca * radiance + cd)).powi(n)
    }

    #[test]
    fn uniform_gray_frame_follows_the_closed_form() {
        let config = SimulationConfig::default();
        let frame = Tensor::filled(FrameShape::new(4, 4, 1), 0.5);
        let output = SingleFrameSimulator::new(config).unwrap().run(&frame).unwrap();

        let expected = euler_closed_form(0.3, 0.3, 0.032, 0.5, 10) as f32;
        assert_relative_eq!(expected, 0.910, epsilon = 1e-3);
        for (&opsin, &afterimage) in output.opsin.as_slice().iter().zip(output.afterimage.as_slice()) {
            assert_relative_eq!(opsin, expected, epsilon = 1e-5);
            assert_relative_eq!(afterimage, 1.0 - expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn repeated_runs_are_bit_identical_and_leave_the_frame_alone() {
        let simulator = SingleFrameSimulator::new(SimulationConfig::default()).unwrap();
        let frame = Tensor::from_fn(FrameShape::new(3, 5, 3), |y, x, c| {
            ((y * 5 + x) * 3 + c) as f32 / 45.0
        });
        let before = frame.clone();

        let first = simulator.run(&frame).unwrap();
        let second = simulator.run(&frame).unwrap();

        assert_eq!(first, second);
        assert_eq!(frame, before);
    }

    #[test]
    fn channel_count_does_not_change_the_algorithm() {
        let kinetics_gray = ChannelKinetics::uniform(0.4, 0.2, 0.05, 12, 1).unwrap();
        let kinetics_wide = ChannelKinetics::uniform(0.4, 0.2, 0.05, 12, 6).unwrap();
        let gray = Tensor::from_fn(FrameShape::new(2, 3, 1), |y, x, _| (y * 3 + x) as f32 / 6.0);
        let wide = Tensor::from_fn(FrameShape::new(2, 3, 6), |y, x, _| (y * 3 + x) as f32 / 6.0);

        let gray_state = simulate(&gray, &kinetics_gray).unwrap();
        let wide_state = simulate(&wide, &kinetics_wide).unwrap();

        for (pixel, expected) in wide_state.pixels().zip(gray_state.as_slice()) {
            assert!(pixel.iter().all(|v| v == expected));
        }
    }

    #[test]
    fn zero_iterations_returns_the_fresh_state() {
        let kinetics = ChannelKinetics::uniform(0.3, 0.3, 0.032, 0, 3).unwrap();
        let radiance = Tensor::filled(FrameShape::new(2, 2, 3), 0.9);
        assert_eq!(simulate(&radiance, &kinetics).unwrap(), Tensor::ones(radiance.shape()));
    }

    #[test]
    fn spectral_run_yields_a_color_afterimage() {
        let simulator =
            SingleFrameSimulator::with_adapter(SimulationConfig::spectral(), Arc::new(ConeRodExcitation))
                .unwrap();
        let frame = Tensor::filled(FrameShape::new(2, 2, 3), 1.0);
        let output = simulator.run(&frame).unwrap();

        assert_eq!(output.opsin.channels(), 4);
        assert_eq!(output.afterimage.channels(), 3);
        assert!(output.afterimage.is_within_unit_range());
        assert!(output.afterimage.min().unwrap() > 0.0);
    }

    #[test]
    fn arity_mismatch_fails_before_simulating() {
        let config = SimulationConfig::builder()
            .ca([0.2f32, 0.3, 0.5])
            .cd([0.1f32, 0.15, 0.2])
            .build()
            .unwrap();
        let simulator = SingleFrameSimulator::new(config).unwrap();
        let gray = Tensor::filled(FrameShape::new(2, 2, 1), 0.5);

        let err = simulator.run(&gray).unwrap_err();
        assert!(matches!(err, SimulationError::Configuration(_)));
    }
}
