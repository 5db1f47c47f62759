// THEORY:
// The retina module prepares the radiance map that reaches the receptors. A
// frame passes through three stages, in order:
// 1.  **Excitation**: the configured `ExcitationAdapter` maps the frame to
//     per-receptor-class excitation. The result is checked against the
//     adapter contract.
// 2.  **Exposure**: samples are scaled by `exposure` to give the effective
//     radiance. Values above 1 are legal here; the integrator contains them.
// 3.  **Anatomy** (optional): radiance is modulated by a cone-density map that
//     peaks at the fovea and falls off as a Gaussian with sigma = radius / 2.
//
// Every stage is a pure function of the frame and the configuration, so the
// same `Retina` can serve stateless and sequential runs alike.

use crate::core_modules::channel_model::SimulationConfig;
use crate::core_modules::excitation::{ExcitationAdapter, validate_excitation};
use crate::core_modules::tensor::{FrameShape, RadianceMap, Tensor};
use crate::error::{SimulationError, SimulationResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Location and extent of the high-density foveal region, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoveaConfig {
    pub center_x: f32,
    pub center_y: f32,
    pub radius: f32,
}

impl FoveaConfig {
    /// A fovea at the centre of a `height` x `width` frame.
    pub fn centered(height: usize, width: usize, radius: f32) -> Self {
        Self {
            center_x: (width as f32 - 1.0) / 2.0,
            center_y: (height as f32 - 1.0) / 2.0,
            radius,
        }
    }

    pub(crate) fn validate(&self) -> SimulationResult<()> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(SimulationError::Configuration(format!(
                "fovea radius must be > 0, got {}",
                self.radius
            )));
        }
        if !self.center_x.is_finite() || !self.center_y.is_finite() {
            return Err(SimulationError::Configuration(
                "fovea center must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scales samples by an exposure factor.
pub fn effective_radiance(frame: &Tensor, exposure: f32) -> RadianceMap {
    frame.map(|v| v * exposure)
}

/// Single-channel cone density, normalized so the peak is 1.
pub fn cone_density_map(height: usize, width: usize, fovea: &FoveaConfig) -> Tensor {
    let sigma = fovea.radius / 2.0;
    let mut density = Tensor::from_fn(FrameShape::new(height, width, 1), |y, x, _| {
        let dx = x as f32 - fovea.center_x;
        let dy = y as f32 - fovea.center_y;
        let dist = (dx * dx + dy * dy).sqrt();
        (-0.5 * (dist / sigma).powi(2)).exp()
    });
    if let Some(peak) = density.max().filter(|peak| *peak > 0.0) {
        density = density.map(|v| v / peak);
    }
    density
}

/// Multiplies every channel of `radiance` by the density at its pixel.
pub fn apply_density(radiance: &RadianceMap, density: &Tensor) -> SimulationResult<RadianceMap> {
    if !radiance.shape().same_extent(&density.shape()) || density.channels() != 1 {
        return Err(SimulationError::ShapeMismatch {
            expected: radiance.shape().with_channels(1),
            found: density.shape(),
        });
    }
    let channels = radiance.channels();
    let mut data = Vec::with_capacity(radiance.shape().len());
    for (pixel, weight) in radiance.pixels().zip(density.as_slice()) {
        data.extend(pixel.iter().map(|v| v * weight));
    }
    Tensor::from_vec(radiance.shape().with_channels(channels), data)
}

/// Turns frames into the radiance maps the integrator consumes.
#[derive(Debug, Clone)]
pub struct Retina {
    adapter: Arc<dyn ExcitationAdapter>,
    exposure: f32,
    fovea: Option<FoveaConfig>,
}

impl Retina {
    pub fn new(config: &SimulationConfig, adapter: Arc<dyn ExcitationAdapter>) -> Self {
        Self {
            adapter,
            exposure: config.exposure,
            fovea: config.fovea,
        }
    }

    pub fn adapter(&self) -> &dyn ExcitationAdapter {
        self.adapter.as_ref()
    }

    /// Shape of the radiance map produced for a frame of `frame_shape`.
    pub fn radiance_shape(&self, frame_shape: FrameShape) -> FrameShape {
        frame_shape.with_channels(self.adapter.output_channels(frame_shape.channels))
    }

    pub fn radiance(&self, frame: &Tensor) -> SimulationResult<RadianceMap> {
        let excitation = self.adapter.excite(frame)?;
        validate_excitation(frame, &excitation)?;

        let radiance = if self.exposure == 1.0 {
            excitation
        } else {
            effective_radiance(&excitation, self.exposure)
        };

        match &self.fovea {
            Some(fovea) => {
                let density = cone_density_map(radiance.height(), radiance.width(), fovea);
                apply_density(&radiance, &density)
            }
            None => Ok(radiance),
        }
    }
}
