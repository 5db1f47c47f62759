// THEORY:
// The `SequenceSimulator` is the stateful heart of the engine. Where the
// single-frame simulator starts every frame from a fresh retina, this one
// carries the opsin state from frame to frame, so bleaching accumulates over
// the whole sequence. It also remembers exactly one afterimage, the previous
// frame's, to build the persistent overlay.
//
// Lifecycle:
//
//     Uninitialized --first frame--> Running --finish / fatal error--> Terminated
//
// 1.  **Initialization**: the first accepted frame fixes the frame shape,
//     resolves the per-channel kinetics for its radiance and allocates a
//     fully sensitive (all ones) opsin state.
// 2.  **Per frame**: shape check, overlay from the previous afterimage,
//     `iterations` integrator steps from the persisted state, new afterimage.
//     Every check runs before the state is touched, so a failing frame never
//     leaves a half-updated state or a partial output behind.
// 3.  **Termination**: a fatal error or `finish` drops the state. Outputs
//     already returned are owned by the caller and stay valid. A terminated
//     simulator rejects further frames; a new sequence needs a new instance.
//
// Frames depend on the state left by the frame before, so a sequence is a
// strict chain and is never split across threads.

use crate::core_modules::afterimage::{DISPLAY_CHANNELS, compose, persistent_overlay};
use crate::core_modules::channel_model::{ChannelKinetics, SimulationConfig};
use crate::core_modules::excitation::{ExcitationAdapter, PassThrough};
use crate::core_modules::kinetics::integrate;
use crate::core_modules::retina::Retina;
use crate::core_modules::tensor::{AfterimageFrame, FrameShape, OpsinState, Tensor};
use crate::error::{SimulationError, SimulationResult};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Observable lifecycle phase of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePhase {
    Uninitialized,
    Running,
    Terminated,
}

/// Everything emitted for one accepted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutput {
    /// Position among emitted frames; skipped input frames take no index.
    pub index: usize,
    pub afterimage: AfterimageFrame,
    pub overlay: Tensor,
}

#[derive(Debug)]
struct RunState {
    frame_shape: FrameShape,
    kinetics: ChannelKinetics,
    opsin: OpsinState,
    previous_afterimage: Option<AfterimageFrame>,
}

#[derive(Debug)]
enum Phase {
    Uninitialized,
    Running(RunState),
    Terminated,
}

/// Carries opsin state and overlay memory across an ordered frame stream.
#[derive(Debug)]
pub struct SequenceSimulator {
    config: SimulationConfig,
    retina: Retina,
    phase: Phase,
    emitted: usize,
}

impl SequenceSimulator {
    pub fn new(config: SimulationConfig) -> SimulationResult<Self> {
        Self::with_adapter(config, Arc::new(PassThrough))
    }

    pub fn with_adapter(
        config: SimulationConfig,
        adapter: Arc<dyn ExcitationAdapter>,
    ) -> SimulationResult<Self> {
        config.validate()?;
        let retina = Retina::new(&config, adapter);
        Ok(Self {
            config,
            retina,
            phase: Phase::Uninitialized,
            emitted: 0,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn phase(&self) -> SequencePhase {
        match self.phase {
            Phase::Uninitialized => SequencePhase::Uninitialized,
            Phase::Running(_) => SequencePhase::Running,
            Phase::Terminated => SequencePhase::Terminated,
        }
    }

    /// Number of frames emitted so far.
    pub fn frames_emitted(&self) -> usize {
        self.emitted
    }

    /// Shape fixed by the first frame, while the sequence runs.
    pub fn frame_shape(&self) -> Option<FrameShape> {
        match &self.phase {
            Phase::Running(run) => Some(run.frame_shape),
            _ => None,
        }
    }

    /// The persisted opsin state, while the sequence runs.
    pub fn opsin_state(&self) -> Option<&OpsinState> {
        match &self.phase {
            Phase::Running(run) => Some(&run.opsin),
            _ => None,
        }
    }

    /// Processes the next frame. Any error other than `SequenceTerminated`
    /// terminates the sequence.
    #[instrument(level = "debug", skip_all, fields(index = self.emitted))]
    pub fn push_frame(&mut self, frame: &Tensor) -> SimulationResult<FrameOutput> {
        let result = self.advance(frame);
        match &result {
            Ok(output) => debug!(
                index = output.index,
                mean_afterimage = output.afterimage.mean(),
                "frame emitted"
            ),
            Err(SimulationError::SequenceTerminated) => {}
            Err(err) => {
                error!(index = self.emitted, error = %err, "sequence terminated by error");
                self.phase = Phase::Terminated;
            }
        }
        result
    }

    /// Ends the sequence and releases its state.
    pub fn finish(&mut self) {
        if !matches!(self.phase, Phase::Terminated) {
            info!(frames = self.emitted, "sequence finished");
        }
        self.phase = Phase::Terminated;
    }

    fn advance(&mut self, frame: &Tensor) -> SimulationResult<FrameOutput> {
        match &self.phase {
            Phase::Terminated => return Err(SimulationError::SequenceTerminated),
            Phase::Running(run) if run.frame_shape != frame.shape() => {
                return Err(SimulationError::ShapeMismatch {
                    expected: run.frame_shape,
                    found: frame.shape(),
                });
            }
            _ => {}
        }

        let pending = match self.phase {
            Phase::Uninitialized => Some(self.start(frame)?),
            _ => None,
        };
        let radiance = self.retina.radiance(frame)?;
        if let Some(run) = pending {
            self.phase = Phase::Running(run);
        }
        let Phase::Running(run) = &mut self.phase else {
            return Err(SimulationError::SequenceTerminated);
        };

        // Also catches an adapter whose output disagrees with `output_channels`.
        if radiance.shape() != run.opsin.shape() {
            return Err(SimulationError::ShapeMismatch {
                expected: run.opsin.shape(),
                found: radiance.shape(),
            });
        }

        let overlay =
            persistent_overlay(frame, run.previous_afterimage.as_ref(), self.config.alpha)?;

        integrate(&mut run.opsin, &radiance, &run.kinetics);
        let afterimage = compose(&run.opsin, self.config.intensity);
        run.previous_afterimage = Some(afterimage.clone());

        let index = self.emitted;
        self.emitted += 1;
        Ok(FrameOutput {
            index,
            afterimage,
            overlay,
        })
    }

    fn start(&self, frame: &Tensor) -> SimulationResult<RunState> {
        let radiance_shape = self.retina.radiance_shape(frame.shape());
        let kinetics = self.config.kinetics_for(radiance_shape.channels)?;

        // The overlay blends the displayable frame with the afterimage, so
        // both must show the same number of channels.
        let frame_display = frame.channels().min(DISPLAY_CHANNELS);
        let afterimage_display = radiance_shape.channels.min(DISPLAY_CHANNELS);
        if frame_display != afterimage_display {
            return Err(SimulationError::ShapeMismatch {
                expected: frame.shape().with_channels(frame_display),
                found: radiance_shape.with_channels(afterimage_display),
            });
        }

        info!(
            frame_shape = %frame.shape(),
            radiance_shape = %radiance_shape,
            adapter = self.retina.adapter().name(),
            "sequence started"
        );
        Ok(RunState {
            frame_shape: frame.shape(),
            kinetics,
            opsin: Tensor::ones(radiance_shape),
            previous_afterimage: None,
        })
    }
}
