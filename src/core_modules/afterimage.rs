// THEORY:
// The composer turns opsin state into what a viewer sees. The afterimage is
// the depleted pigment fraction, scaled and clamped:
//
//     afterimage = clamp(intensity * (1 - state), 0, 1)
//
// Runs with more than three receptor classes keep only the first three (the
// cones) so the result is a displayable colour image. The rod and any further
// classes still drive the kinetics; they are simply not shown.
//
// The same weighted blend backs both the persistent overlay (current frame
// over the previous afterimage) and the writer-side "blended" output
// (original over afterimage). Both operands are f32 samples in [0, 1], so the
// blend never mixes sample ranges.

use crate::core_modules::tensor::{AfterimageFrame, OpsinState, Tensor, clamp_unit};
use crate::error::{SimulationError, SimulationResult};

/// Channels that survive into a displayable result.
pub const DISPLAY_CHANNELS: usize = 3;

/// Afterimage signal for the current opsin state.
pub fn compose(state: &OpsinState, intensity: f32) -> AfterimageFrame {
    state
        .leading_channels(DISPLAY_CHANNELS)
        .map(|opsin| clamp_unit(intensity * (1.0 - opsin)))
}

/// The channels of a frame that a display can show.
pub fn displayable(frame: &Tensor) -> Tensor {
    frame.leading_channels(DISPLAY_CHANNELS).clamp_unit()
}

/// `weight * foreground + (1 - weight) * background`, clamped to [0, 1].
pub fn blend(foreground: &Tensor, background: &Tensor, weight: f32) -> SimulationResult<Tensor> {
    if foreground.shape() != background.shape() {
        return Err(SimulationError::ShapeMismatch {
            expected: foreground.shape(),
            found: background.shape(),
        });
    }
    let data = foreground
        .as_slice()
        .iter()
        .zip(background.as_slice())
        .map(|(&f, &b)| clamp_unit(weight * f + (1.0 - weight) * b))
        .collect();
    Tensor::from_vec(foreground.shape(), data)
}

/// Overlay for one frame of a sequence. The first frame (no previous
/// afterimage) is shown as is; later frames are blended with the afterimage
/// of the frame before.
pub fn persistent_overlay(
    frame: &Tensor,
    previous_afterimage: Option<&AfterimageFrame>,
    alpha: f32,
) -> SimulationResult<Tensor> {
    let current = displayable(frame);
    match previous_afterimage {
        None => Ok(current),
        Some(previous) => blend(&current, previous, alpha),
    }
}
