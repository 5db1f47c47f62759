// THEORY:
// Single-frame simulation is stateless, so a batch of independent frames can
// be spread over several workers with no coordination beyond putting the
// results back in order. The `BatchPool` does exactly that:
// - One dispatcher task receives every `FrameTask` and hands them to the
//   workers round-robin.
// - Each worker owns its own `SingleFrameSimulator` and answers through the
//   task's oneshot channel.
// - `process_batch` awaits the replies with `join_all`, which yields them in
//   submission order regardless of which worker finished first.
//
// Sequences are never fed through the pool: a sequence frame depends on the
// state its predecessor left behind.

use crate::core_modules::channel_model::SimulationConfig;
use crate::core_modules::excitation::{ExcitationAdapter, PassThrough};
use crate::core_modules::single_frame::{SingleFrameOutput, SingleFrameSimulator};
use crate::core_modules::tensor::Tensor;
use crate::error::{SimulationError, SimulationResult};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub struct FrameTask {
    pub frame_id: u64,
    pub frame: Tensor,
    pub result_sender: oneshot::Sender<SimulationResult<SingleFrameOutput>>,
}

/// Fixed set of tokio workers running independent single-frame simulations.
/// Must be created inside a tokio runtime.
pub struct BatchPool {
    task_sender: mpsc::UnboundedSender<FrameTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
    frame_counter: AtomicU64,
}

impl BatchPool {
    /// One worker per logical CPU.
    pub fn new(config: SimulationConfig) -> SimulationResult<Self> {
        Self::with_adapter(config, Arc::new(PassThrough), num_cpus::get())
    }

    pub fn with_adapter(
        config: SimulationConfig,
        adapter: Arc<dyn ExcitationAdapter>,
        worker_count: usize,
    ) -> SimulationResult<Self> {
        let simulator = SingleFrameSimulator::with_adapter(config, adapter)?;
        let worker_count = worker_count.max(1);

        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<FrameTask>();
        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<FrameTask>())
            .unzip();

        tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                // A closed worker drops the task, which the caller sees as a
                // dropped reply.
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_count;
            }
        });

        let workers = worker_receivers
            .into_iter()
            .enumerate()
            .map(|(worker_id, mut worker_receiver)| {
                let simulator = simulator.clone();
                tokio::spawn(async move {
                    while let Some(task) = worker_receiver.recv().await {
                        debug!(worker_id, frame_id = task.frame_id, "simulating frame");
                        let result = simulator.run(&task.frame);
                        let _ = task.result_sender.send(result);
                    }
                })
            })
            .collect();

        Ok(Self {
            task_sender,
            workers,
            frame_counter: AtomicU64::new(0),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Simulates one frame on the next worker in line.
    pub async fn process(&self, frame: Tensor) -> SimulationResult<SingleFrameOutput> {
        let (result_sender, result_receiver) = oneshot::channel();
        let task = FrameTask {
            frame_id: self.frame_counter.fetch_add(1, Ordering::Relaxed),
            frame,
            result_sender,
        };

        self.task_sender
            .send(task)
            .map_err(|_| SimulationError::WorkerPool("failed to send task to worker pool"))?;

        result_receiver
            .await
            .map_err(|_| SimulationError::WorkerPool("failed to receive result from worker"))?
    }

    /// Simulates every frame independently; results keep the input order.
    pub async fn process_batch(&self, frames: Vec<Tensor>) -> Vec<SimulationResult<SingleFrameOutput>> {
        join_all(frames.into_iter().map(|frame| self.process(frame))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::excitation::ConeRodExcitation;
    use crate::core_modules::tensor::FrameShape;

    fn frames(count: usize) -> Vec<Tensor> {
        (0..count)
            .map(|i| {
                Tensor::from_fn(FrameShape::new(4, 4, 3), |y, x, c| {
                    ((i + y * 4 + x + c) % 11) as f32 / 10.0
                })
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_matches_sequential_runs_in_order() {
        let config = SimulationConfig::default();
        let pool = BatchPool::with_adapter(config.clone(), Arc::new(PassThrough), 3).unwrap();
        let simulator = SingleFrameSimulator::new(config).unwrap();
        let input = frames(10);

        let results = pool.process_batch(input.clone()).await;

        assert_eq!(results.len(), 10);
        for (frame, result) in input.iter().zip(results) {
            assert_eq!(result.unwrap(), simulator.run(frame).unwrap());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_failing_frame_does_not_affect_its_neighbours() {
        let pool = BatchPool::with_adapter(SimulationConfig::spectral(), Arc::new(ConeRodExcitation), 2)
            .unwrap();
        let mut input = frames(3);
        input[1] = Tensor::ones(FrameShape::new(4, 4, 1));

        let results = pool.process_batch(input).await;

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(SimulationError::ShapeMismatch { .. })));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn default_pool_has_at_least_one_worker() {
        let pool = BatchPool::new(SimulationConfig::default()).unwrap();
        assert!(pool.worker_count() >= 1);

        let zero = BatchPool::with_adapter(SimulationConfig::default(), Arc::new(PassThrough), 0).unwrap();
        assert_eq!(zero.worker_count(), 1);
        assert!(zero.process(Tensor::ones(FrameShape::new(1, 1, 1))).await.is_ok());
    }
}
