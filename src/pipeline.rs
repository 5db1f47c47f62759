// THEORY:
// The `pipeline` module is the top-level API for running a whole frame stream.
// It wraps a `SequenceSimulator` in the loop every caller would otherwise
// write by hand:
// 1.  **Read**: frames arrive as `Result`s from any iterator. A frame that
//     could not be read is logged, recorded in the report and skipped; the
//     opsin state simply carries on to the next readable frame.
// 2.  **Cancel**: a `StopHandle` is checked before each frame. Cancellation
//     therefore always lands between frames, never inside one.
// 3.  **Simulate & emit**: each readable frame is pushed through the sequence
//     and its output handed to a `FrameSink`.
// 4.  **Report**: the run ends with a `SequenceReport` saying how many frames
//     were emitted, which were skipped and why the run stopped.
//
// A fatal error (shape change, sink failure) stops the run but leaves every
// output already handed to the sink in place.

use crate::core_modules::channel_model::SimulationConfig;
use crate::core_modules::excitation::{ExcitationAdapter, PassThrough};
use crate::core_modules::sequence::SequenceSimulator;
use crate::core_modules::tensor::Tensor;
use crate::error::{FrameReadError, SimulationError, SimulationResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, instrument, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::sequence::{FrameOutput, SequencePhase};

/// Receives every emitted frame together with the input it came from.
pub trait FrameSink {
    fn accept(&mut self, frame: &Tensor, output: &FrameOutput) -> SimulationResult<()>;
}

impl<S: FrameSink + ?Sized> FrameSink for &mut S {
    fn accept(&mut self, frame: &Tensor, output: &FrameOutput) -> SimulationResult<()> {
        (**self).accept(frame, output)
    }
}

/// Keeps every output in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    pub outputs: Vec<FrameOutput>,
}

impl FrameSink for CollectingSink {
    fn accept(&mut self, _frame: &Tensor, output: &FrameOutput) -> SimulationResult<()> {
        self.outputs.push(output.clone());
        Ok(())
    }
}

/// Cooperative cancellation flag, shareable across threads.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a run ended.
#[derive(Debug)]
pub enum Termination {
    /// The source ran out of frames.
    Exhausted,
    /// A stop was requested.
    Cancelled,
    Failed(SimulationError),
}

/// Outcome of a pipeline run.
#[derive(Debug)]
pub struct SequenceReport {
    pub emitted: usize,
    pub skipped: Vec<FrameReadError>,
    pub termination: Termination,
}

impl SequenceReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.termination, Termination::Failed(_))
    }
}

/// Drives a frame stream through a fresh sequence simulator per run.
#[derive(Debug, Clone)]
pub struct AfterimagePipeline {
    config: SimulationConfig,
    adapter: Arc<dyn ExcitationAdapter>,
}

impl AfterimagePipeline {
    pub fn new(config: SimulationConfig) -> SimulationResult<Self> {
        Self::with_adapter(config, Arc::new(PassThrough))
    }

    pub fn with_adapter(
        config: SimulationConfig,
        adapter: Arc<dyn ExcitationAdapter>,
    ) -> SimulationResult<Self> {
        config.validate()?;
        Ok(Self { config, adapter })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[instrument(name = "afterimage_pipeline", skip_all, fields(adapter = self.adapter.name()))]
    pub fn run<I, S>(&self, frames: I, sink: &mut S, stop: &StopHandle) -> SequenceReport
    where
        I: IntoIterator<Item = Result<Tensor, FrameReadError>>,
        S: FrameSink + ?Sized,
    {
        let mut skipped = Vec::new();
        let mut sequence =
            match SequenceSimulator::with_adapter(self.config.clone(), Arc::clone(&self.adapter)) {
                Ok(sequence) => sequence,
                Err(err) => {
                    return SequenceReport {
                        emitted: 0,
                        skipped,
                        termination: Termination::Failed(err),
                    };
                }
            };

        let mut emitted = 0;
        let mut termination = Termination::Exhausted;
        for item in frames {
            if stop.is_stop_requested() {
                info!(emitted, "stop requested");
                termination = Termination::Cancelled;
                break;
            }

            let frame = match item {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(index = err.index, path = %err.path.display(), reason = %err.reason, "skipping unreadable frame");
                    skipped.push(err);
                    continue;
                }
            };

            let delivered = sequence
                .push_frame(&frame)
                .and_then(|output| sink.accept(&frame, &output));
            match delivered {
                Ok(()) => emitted += 1,
                Err(err) => {
                    termination = Termination::Failed(err);
                    break;
                }
            }
        }

        sequence.finish();
        info!(emitted, skipped = skipped.len(), "pipeline run complete");
        SequenceReport {
            emitted,
            skipped,
            termination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::tensor::FrameShape;
    use std::path::PathBuf;

    fn gray(height: usize, width: usize, value: f32) -> Tensor {
        Tensor::filled(FrameShape::new(height, width, 1), value)
    }

    fn unreadable(index: usize) -> FrameReadError {
        FrameReadError {
            index,
            path: PathBuf::from(format!("frame_{index}.png")),
            reason: "corrupt".to_string(),
        }
    }

    struct FailingSink {
        fail_at: usize,
        accepted: usize,
    }

    impl FrameSink for FailingSink {
        fn accept(&mut self, _frame: &Tensor, output: &FrameOutput) -> SimulationResult<()> {
            if output.index == self.fail_at {
                return Err(SimulationError::Io(std::io::Error::other("disk full")));
            }
            self.accepted += 1;
            Ok(())
        }
    }

    #[test]
    fn exhausts_a_clean_stream() {
        let pipeline = AfterimagePipeline::new(SimulationConfig::default()).unwrap();
        let frames = (0..4).map(|_| Ok::<_, FrameReadError>(gray(3, 3, 0.6)));
        let mut sink = CollectingSink::default();
        let report = pipeline.run(frames, &mut sink, &StopHandle::new());

        assert!(matches!(report.termination, Termination::Exhausted));
        assert_eq!(report.emitted, 4);
        assert_eq!(sink.outputs.len(), 4);
        let indices: Vec<_> = sink.outputs.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn unreadable_frames_are_skipped_and_state_carries_on() {
        let pipeline = AfterimagePipeline::new(SimulationConfig::default()).unwrap();
        let frame = gray(2, 2, 0.9);
        let frames = vec![Ok(frame.clone()), Err(unreadable(1)), Ok(frame.clone())];
        let mut sink = CollectingSink::default();
        let report = pipeline.run(frames, &mut sink, &StopHandle::new());

        assert!(report.is_success());
        assert_eq!(report.emitted, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].index, 1);

        let mut reference = SequenceSimulator::new(SimulationConfig::default()).unwrap();
        reference.push_frame(&frame).unwrap();
        let second = reference.push_frame(&frame).unwrap();
        assert_eq!(sink.outputs[1], second);
    }

    #[test]
    fn unreadable_first_frame_leaves_the_first_overlay_unblended() {
        let pipeline = AfterimagePipeline::new(SimulationConfig::default()).unwrap();
        let frame = gray(2, 2, 0.6);
        let frames = vec![Err(unreadable(0)), Ok(frame.clone()), Ok(frame.clone())];
        let mut sink = CollectingSink::default();
        let report = pipeline.run(frames, &mut sink, &StopHandle::new());

        assert!(matches!(report.termination, Termination::Exhausted));
        assert_eq!(report.emitted, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(sink.outputs[0].index, 0);
        assert_eq!(sink.outputs[0].overlay, frame);
        assert_eq!(sink.outputs[1].index, 1);
    }

    #[test]
    fn shape_change_fails_the_run_after_emitting_earlier_frames() {
        let pipeline = AfterimagePipeline::new(SimulationConfig::default()).unwrap();
        let frames: Vec<Result<Tensor, FrameReadError>> =
            vec![Ok(gray(4, 4, 0.5)), Ok(gray(5, 4, 0.5)), Ok(gray(4, 4, 0.5))];
        let mut sink = CollectingSink::default();
        let report = pipeline.run(frames, &mut sink, &StopHandle::new());

        assert!(!report.is_success());
        assert!(matches!(
            report.termination,
            Termination::Failed(SimulationError::ShapeMismatch { .. })
        ));
        assert_eq!(report.emitted, 1);
        assert_eq!(sink.outputs.len(), 1);
        assert!(sink.outputs[0].afterimage.is_within_unit_range());
    }

    #[test]
    fn stop_lands_between_frames() {
        let pipeline = AfterimagePipeline::new(SimulationConfig::default()).unwrap();
        let stop = StopHandle::new();
        let trigger = stop.clone();
        let frames = (0..10).map(move |i| {
            if i == 3 {
                trigger.request_stop();
            }
            Ok::<_, FrameReadError>(gray(2, 2, 0.4))
        });
        let mut sink = CollectingSink::default();
        let report = pipeline.run(frames, &mut sink, &stop);

        assert!(matches!(report.termination, Termination::Cancelled));
        assert_eq!(report.emitted, 3);
        assert_eq!(sink.outputs.len(), 3);
    }

    #[test]
    fn sink_failure_stops_the_run() {
        let pipeline = AfterimagePipeline::new(SimulationConfig::default()).unwrap();
        let frames = (0..5).map(|_| Ok::<_, FrameReadError>(gray(2, 2, 0.4)));
        let mut sink = FailingSink {
            fail_at: 2,
            accepted: 0,
        };
        let report = pipeline.run(frames, &mut sink, &StopHandle::new());

        assert!(matches!(
            report.termination,
            Termination::Failed(SimulationError::Io(_))
        ));
        assert_eq!(sink.accepted, 2);
        assert_eq!(report.emitted, 2);
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let config = SimulationConfig {
            dt: 0.0,
            ..SimulationConfig::default()
        };
        assert!(matches!(
            AfterimagePipeline::new(config),
            Err(SimulationError::Configuration(_))
        ));
    }
}
