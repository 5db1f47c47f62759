// THEORY:
// Every failure the engine can report lives in one enum. The kinds differ in
// how far they reach:
// - `Configuration` is raised before any simulation starts, or when a buffer
//   is built with the wrong number of samples.
// - `ShapeMismatch` ends the run it occurs in, but never retracts frames that
//   were already emitted.
// - `FrameRead` is recovered locally by the pipeline: the frame is skipped and
//   the sequence continues.

use crate::core_modules::tensor::FrameShape;
use std::path::PathBuf;
use thiserror::Error;

/// Root error type for all simulation failures.
#[derive(Error, Debug)]
pub enum SimulationError {
    /// Invalid kinetics or output parameters (dt, iterations, arity, alpha...)
    /// or a sample buffer whose length does not fit its shape.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A frame or state does not match the shape fixed for the run.
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: FrameShape, found: FrameShape },

    /// A frame from the external source could not be decoded.
    #[error(transparent)]
    FrameRead(#[from] FrameReadError),

    /// Raised only by the strict integrator entry point.
    #[error("radiance sample {index} out of range: {value}")]
    RadianceOutOfRange { index: usize, value: f32 },

    /// The excitation adapter produced a tensor that violates its contract.
    #[error("invalid excitation: {0}")]
    InvalidExcitation(String),

    /// A frame was pushed into a sequence that already ended.
    #[error("sequence already terminated")]
    SequenceTerminated,

    /// The tensor cannot be encoded as a displayable image.
    #[error("cannot encode a {0}-channel tensor as an image")]
    UnsupportedChannels(usize),

    /// The batch pool's workers are gone (runtime shut down).
    #[error("worker pool unavailable: {0}")]
    WorkerPool(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type SimulationResult<T> = Result<T, SimulationError>;

/// A frame that the source failed to read or decode.
#[derive(Error, Debug)]
#[error("failed to read frame {index} ({}): {reason}", path.display())]
pub struct FrameReadError {
    /// Position of the frame in the source listing.
    pub index: usize,
    pub path: PathBuf,
    pub reason: String,
}
