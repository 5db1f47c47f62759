// THEORY:
// An excitation adapter turns a decoded frame into the radiance map the
// kinetics model consumes. It is a pluggable strategy: the engine only relies
// on the contract of its output (same H x W as the frame, finite and
// non-negative samples), never on how the adapter computed it.
//
// Two strategies ship with the crate:
// - `PassThrough` feeds the frame itself to the integrator. Grayscale and RGB
//   runs use it; so do callers who already hold per-receptor excitations.
// - `ConeRodExcitation` maps sRGB pixels to four receptor classes: the L, M
//   and S cones and the rod. Each pixel is linearized with a 256-entry LUT,
//   converted to CIE XYZ (D65), then projected onto the Hunt-Pointer-Estevez
//   cone fundamentals. The rod class uses a linear scotopic approximation
//   from XYZ. Every output depends only on its own pixel.

use crate::core_modules::tensor::{FrameShape, RadianceMap, Tensor};
use crate::error::{SimulationError, SimulationResult};
use std::fmt;
use std::sync::OnceLock;

/// Number of receptor classes produced by `ConeRodExcitation`.
pub const CONE_ROD_CLASSES: usize = 4;

// sRGB (D65) -> CIE XYZ.
const SRGB_TO_XYZ: [[f32; 3]; 3] = [
    [0.4124564, 0.3575761, 0.1804375],
    [0.2126729, 0.7151522, 0.0721750],
    [0.0193339, 0.1191920, 0.9503041],
];

// CIE XYZ -> LMS (Hunt-Pointer-Estevez).
const XYZ_TO_LMS: [[f32; 3]; 3] = [
    [0.38971, 0.68898, -0.07868],
    [-0.22981, 1.18340, 0.04641],
    [0.0, 0.0, 1.0],
];

// CIE XYZ -> scotopic (rod) response.
const XYZ_TO_ROD: [f32; 3] = [-0.702, 1.039, 0.433];

static SRGB_TO_LINEAR_LUT: OnceLock<[f32; 256]> = OnceLock::new();

/// Maps a frame to a per-receptor-class excitation tensor.
pub trait ExcitationAdapter: Send + Sync + fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Channel count of the excitation produced for a frame with
    /// `input_channels` channels.
    fn output_channels(&self, input_channels: usize) -> usize;

    fn excite(&self, frame: &Tensor) -> SimulationResult<RadianceMap>;
}

/// The frame is the radiance map.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl ExcitationAdapter for PassThrough {
    fn name(&self) -> &'static str {
        "pass-through"
    }

    fn output_channels(&self, input_channels: usize) -> usize {
        input_channels
    }

    fn excite(&self, frame: &Tensor) -> SimulationResult<RadianceMap> {
        Ok(frame.clone())
    }
}

/// Per-pixel sRGB to L, M, S cone and rod excitation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConeRodExcitation;

impl ConeRodExcitation {
    /// Excitation of one sRGB pixel, ordered L, M, S, rod.
    pub fn excite_pixel(rgb: &[f32]) -> [f32; CONE_ROD_CLASSES] {
        let linear = [
            srgb_to_linear(rgb[0]),
            srgb_to_linear(rgb[1]),
            srgb_to_linear(rgb[2]),
        ];
        let xyz = apply_matrix(&SRGB_TO_XYZ, &linear);
        let lms = apply_matrix(&XYZ_TO_LMS, &xyz);
        let rod = XYZ_TO_ROD[0] * xyz[0] + XYZ_TO_ROD[1] * xyz[1] + XYZ_TO_ROD[2] * xyz[2];
        [lms[0].max(0.0), lms[1].max(0.0), lms[2].max(0.0), rod.max(0.0)]
    }
}

impl ExcitationAdapter for ConeRodExcitation {
    fn name(&self) -> &'static str {
        "cone-rod"
    }

    fn output_channels(&self, _input_channels: usize) -> usize {
        CONE_ROD_CLASSES
    }

    fn excite(&self, frame: &Tensor) -> SimulationResult<RadianceMap> {
        if frame.channels() != 3 {
            return Err(SimulationError::ShapeMismatch {
                expected: frame.shape().with_channels(3),
                found: frame.shape(),
            });
        }
        let shape = frame.shape().with_channels(CONE_ROD_CLASSES);
        let mut data = Vec::with_capacity(shape.len());
        for pixel in frame.pixels() {
            data.extend_from_slice(&Self::excite_pixel(pixel));
        }
        Tensor::from_vec(shape, data)
    }
}

/// Checks an adapter's output against the frame it was computed from.
pub fn validate_excitation(frame: &Tensor, excitation: &RadianceMap) -> SimulationResult<()> {
    if !excitation.shape().same_extent(&frame.shape()) || excitation.channels() == 0 {
        return Err(SimulationError::ShapeMismatch {
            expected: FrameShape::new(frame.height(), frame.width(), excitation.channels().max(1)),
            found: excitation.shape(),
        });
    }
    if let Some(value) = excitation
        .as_slice()
        .iter()
        .find(|v| !v.is_finite() || **v < 0.0)
    {
        return Err(SimulationError::InvalidExcitation(format!(
            "excitation samples must be finite and >= 0, found {value}"
        )));
    }
    Ok(())
}

/// sRGB-encoded sample in [0, 1] to linear light in [0, 1]. Samples are
/// quantized to 8 bits, matching the precision of decoded frames.
#[inline]
fn srgb_to_linear(value: f32) -> f32 {
    let table = SRGB_TO_LINEAR_LUT.get_or_init(|| {
        let mut table = [0.0f32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let srgb = i as f32 / 255.0;
            *entry = if srgb <= 0.04045 {
                srgb / 12.92
            } else {
                ((srgb + 0.055) / 1.055).powf(2.4)
            };
        }
        table
    });
    let index = if value.is_nan() {
        0
    } else {
        (value.clamp(0.0, 1.0) * 255.0).round() as usize
    };
    table[index]
}

#[inline]
fn apply_matrix(matrix: &[[f32; 3]; 3], v: &[f32; 3]) -> [f32; 3] {
    [
        matrix[0][0] * v[0] + matrix[0][1] * v[1] + matrix[0][2] * v[2],
        matrix[1][0] * v[0] + matrix[1][1] * v[1] + matrix[1][2] * v[2],
        matrix[2][0] * v[0] + matrix[2][1] * v[1] + matrix[2][2] * v[2],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn pass_through_returns_the_frame() {
        let frame = Tensor::from_fn(FrameShape::new(2, 2, 1), |y, x, _| (y + x) as f32 / 2.0);
        assert_eq!(PassThrough.excite(&frame).unwrap(), frame);
        assert_eq!(PassThrough.output_channels(1), 1);
    }

    #[test]
    fn white_excites_all_four_classes() {
        let [l, m, s, rod] = ConeRodExcitation::excite_pixel(&[1.0, 1.0, 1.0]);
        assert_abs_diff_eq!(l, 0.974, epsilon = 2e-3);
        assert_abs_diff_eq!(m, 1.016, epsilon = 2e-3);
        assert_abs_diff_eq!(s, 1.089, epsilon = 2e-3);
        assert_abs_diff_eq!(rod, 0.843, epsilon = 2e-3);
    }

    #[test]
    fn black_produces_no_excitation() {
        assert_eq!(ConeRodExcitation::excite_pixel(&[0.0, 0.0, 0.0]), [0.0; 4]);
    }

    #[test]
    fn response_follows_the_pixel() {
        let red = ConeRodExcitation::excite_pixel(&[1.0, 0.0, 0.0]);
        let blue = ConeRodExcitation::excite_pixel(&[0.0, 0.0, 1.0]);
        assert!(red[0] > blue[0]);
        assert!(blue[2] > red[2]);
    }

    #[test]
    fn cone_rod_output_is_four_channel_and_valid() {
        let mut rng = StdRng::seed_from_u64(3);
        let frame = Tensor::from_fn(FrameShape::new(5, 4, 3), |_, _, _| rng.random_range(0.0..=1.0));
        let excitation = ConeRodExcitation.excite(&frame).unwrap();

        assert_eq!(excitation.shape(), FrameShape::new(5, 4, 4));
        assert!(validate_excitation(&frame, &excitation).is_ok());
    }

    #[test]
    fn cone_rod_rejects_non_rgb_frames() {
        let gray = Tensor::ones(FrameShape::new(2, 2, 1));
        let err = ConeRodExcitation.excite(&gray).unwrap_err();
        assert!(matches!(err, SimulationError::ShapeMismatch { .. }));
    }

    #[test]
    fn validation_catches_broken_adapter_output() {
        let frame = Tensor::ones(FrameShape::new(2, 2, 3));

        let wrong_extent = Tensor::ones(FrameShape::new(2, 3, 4));
        assert!(matches!(
            validate_excitation(&frame, &wrong_extent),
            Err(SimulationError::ShapeMismatch { .. })
        ));

        let mut negative = Tensor::ones(FrameShape::new(2, 2, 4));
        negative.set(1, 1, 3, -0.5);
        assert!(matches!(
            validate_excitation(&frame, &negative),
            Err(SimulationError::InvalidExcitation(_))
        ));

        let unnormalized = Tensor::filled(FrameShape::new(2, 2, 4), 7.5);
        assert!(validate_excitation(&frame, &unnormalized).is_ok());
    }
}
