// THEORY:
// `Tensor` is the single "dumb" data container shared by every stage of the
// engine. Radiance maps, opsin states and afterimages are all H x W x C grids
// of `f32` samples, so they share one representation and differ only in the
// range of values the stage guarantees.
//
// Layout is row-major and channel-interleaved, the same order the `image`
// crate uses for its buffers:
//
//     index = (y * width + x) * channels + c
//
// Keeping every channel of a pixel adjacent lets the integrator walk the
// buffer one pixel at a time and look up per-channel constants by offset,
// whatever the channel count is.

use crate::error::{SimulationError, SimulationResult};
use std::fmt;

/// The H x W x C extent of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl FrameShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Number of pixels (H x W).
    pub fn pixel_count(&self) -> usize {
        self.height * self.width
    }

    /// Number of samples (H x W x C).
    pub fn len(&self) -> usize {
        self.pixel_count() * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The same spatial extent with a different channel count.
    pub fn with_channels(&self, channels: usize) -> Self {
        Self {
            channels,
            ..*self
        }
    }

    pub fn same_extent(&self, other: &FrameShape) -> bool {
        self.height == other.height && self.width == other.width
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// A row-major, channel-interleaved H x W x C grid of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: FrameShape,
    data: Vec<f32>,
}

/// Normalized light signal driving the kinetics model.
pub type RadianceMap = Tensor;
/// Fraction of unbleached pigment per pixel and receptor channel, in [0, 1].
pub type OpsinState = Tensor;
/// Displayable afterimage signal, 1 or 3 channels, in [0, 1].
pub type AfterimageFrame = Tensor;

impl Tensor {
    pub fn filled(shape: FrameShape, value: f32) -> Self {
        Self {
            shape,
            data: vec![value; shape.len()],
        }
    }

    /// A fully sensitive opsin state.
    pub fn ones(shape: FrameShape) -> Self {
        Self::filled(shape, 1.0)
    }

    pub fn zeros(shape: FrameShape) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Wraps an existing buffer. The buffer length must match the shape.
    pub fn from_vec(shape: FrameShape, data: Vec<f32>) -> SimulationResult<Self> {
        if data.len() != shape.len() {
            return Err(SimulationError::Configuration(format!(
                "buffer of {} samples does not fit shape {shape} ({} samples)",
                data.len(),
                shape.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Builds a tensor by evaluating `f(y, x, c)` for every sample.
    pub fn from_fn(shape: FrameShape, mut f: impl FnMut(usize, usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(shape.len());
        for y in 0..shape.height {
            for x in 0..shape.width {
                for c in 0..shape.channels {
                    data.push(f(y, x, c));
                }
            }
        }
        Self { shape, data }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn height(&self) -> usize {
        self.shape.height
    }

    pub fn width(&self) -> usize {
        self.shape.width
    }

    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    fn offset(&self, y: usize, x: usize, c: usize) -> usize {
        (y * self.shape.width + x) * self.shape.channels + c
    }

    /// Sample at (y, x, c). Panics when out of bounds, like slice indexing.
    pub fn get(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[self.offset(y, x, c)]
    }

    pub fn set(&mut self, y: usize, x: usize, c: usize, value: f32) {
        let offset = self.offset(y, x, c);
        self.data[offset] = value;
    }

    /// All channels of the pixel at (y, x).
    pub fn pixel(&self, y: usize, x: usize) -> &[f32] {
        let start = self.offset(y, x, 0);
        &self.data[start..start + self.shape.channels]
    }

    /// Iterates over pixels, each yielded as its channel slice.
    pub fn pixels(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.shape.channels.max(1))
    }

    /// Applies `f` to every sample, producing a new tensor of the same shape.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Keeps only the first `count` channels of every pixel.
    /// Returns a plain copy when the tensor has `count` channels or fewer.
    pub fn leading_channels(&self, count: usize) -> Tensor {
        if self.shape.channels <= count {
            return self.clone();
        }
        let shape = self.shape.with_channels(count);
        let mut data = Vec::with_capacity(shape.len());
        for pixel in self.pixels() {
            data.extend_from_slice(&pixel[..count]);
        }
        Tensor { shape, data }
    }

    pub fn min(&self) -> Option<f32> {
        self.data.iter().copied().reduce(f32::min)
    }

    pub fn max(&self) -> Option<f32> {
        self.data.iter().copied().reduce(f32::max)
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.data.iter().map(|&v| v as f64).sum();
        (sum / self.data.len() as f64) as f32
    }

    /// True when every sample is finite and in [0, 1].
    pub fn is_within_unit_range(&self) -> bool {
        self.data.iter().all(|v| (0.0..=1.0).contains(v))
    }

    /// Clamps every sample to [0, 1]; NaN becomes 0.
    pub fn clamp_unit(&self) -> Tensor {
        self.map(clamp_unit)
    }
}

/// Clamps a sample to [0, 1]. NaN maps to 0 so it cannot leak downstream.
#[inline]
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
