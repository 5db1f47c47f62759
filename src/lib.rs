// THEORY:
// This file is the entry point for the `opsin_vision` library crate. It
// simulates how photopigment (opsin) in the retina bleaches under light and
// regenerates in darkness, and derives the afterimage a viewer would see from
// the depleted pigment.
//
// The public surface is layered:
// - `pipeline::AfterimagePipeline` is the high-level interface: feed it a
//   stream of frames and a sink, get a `SequenceReport` back.
// - `parallel_pipeline::BatchPool` runs independent stills across workers.
// - `core_modules` holds the building blocks (kinetics integrator, single-frame
//   and sequence simulators, excitation adapters, image I/O) for callers who
//   need finer control.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::channel_model::{ChannelConstant, ChannelKinetics, SimulationConfig};
pub use core_modules::excitation::{ConeRodExcitation, ExcitationAdapter, PassThrough};
pub use core_modules::sequence::{FrameOutput, SequencePhase, SequenceSimulator};
pub use core_modules::single_frame::{SingleFrameOutput, SingleFrameSimulator};
pub use core_modules::tensor::{FrameShape, Tensor};
pub use error::{FrameReadError, SimulationError, SimulationResult};
