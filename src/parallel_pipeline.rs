// THEORY:
// Preprocessing and smoothing are the expensive, purely per-frame part of the
// engine; the background model and the tracker are cheap but strictly
// sequential. The `ParallelPipeline` splits the work along that line:
//
// 1.  **Fan out**: each raw frame is handed to a blocking worker task that
//     runs `prepare_frame` on it. Up to `workers` frames are in flight.
// 2.  **Ordered funnel**: `buffered` yields the prepared frames in the order
//     they were read, whatever order the workers finish in. The window is
//     bounded, so a slow frame stalls the read-ahead instead of letting it grow.
// 3.  **Sequential tail**: prepared frames go through the same
//     `DetectionPipeline` as in a sequential run, so the tracks are identical.
//
// `process` pulls raw frames from the source iterator on the async task, so
// decoding stays serial there. Sources that can read any frame by index use
// `process_indexed`, which moves the read itself onto the workers.

use crate::config::Config;
use crate::error::{ChamberError, Result};
use crate::pipeline::{prepare_frame, DetectionPipeline, Frame, GrayFrame, Track};
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;

pub struct ParallelPipeline {
    pipeline: DetectionPipeline,
    config: Arc<Config>,
    workers: usize,
}

impl ParallelPipeline {
    /// Uses one worker per logical CPU.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_workers(config, num_cpus::get())
    }

    pub fn with_workers(config: Config, workers: usize) -> Result<Self> {
        let pipeline = DetectionPipeline::new(config.clone())?;
        Ok(Self {
            pipeline,
            config: Arc::new(config),
            workers: workers.max(1),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Consumes a whole frame stream and returns every track. The first error
    /// (from the source, a worker or a stage) stops the run.
    pub async fn process<I>(self, frames: I) -> Result<Vec<Track>>
    where
        I: IntoIterator<Item = Result<Frame>>,
    {
        let config = Arc::clone(&self.config);
        let workers = self.workers;
        let prepared = stream::iter(frames)
            .map(|item| {
                let config = Arc::clone(&config);
                async move {
                    let frame = item?;
                    let index = frame.index();
                    run_on_worker(index, move || prepare_frame(&frame, &config)).await
                }
            })
            .buffered(workers);
        self.drain(prepared).await
    }

    /// Processes frames `0..count`, reading each one with `load` on a worker.
    /// `load` may be called for several indices at once and in any order.
    pub async fn process_indexed<L>(self, count: u64, load: L) -> Result<Vec<Track>>
    where
        L: Fn(u64) -> Result<Frame> + Send + Sync + 'static,
    {
        let load = Arc::new(load);
        let config = Arc::clone(&self.config);
        let workers = self.workers;
        let prepared = stream::iter(0..count)
            .map(|index| {
                let (load, config) = (Arc::clone(&load), Arc::clone(&config));
                run_on_worker(index, move || prepare_frame(&load(index)?, &config))
            })
            .buffered(workers);
        self.drain(prepared).await
    }

    async fn drain<S>(mut self, prepared: S) -> Result<Vec<Track>>
    where
        S: Stream<Item = Result<GrayFrame>>,
    {
        let mut prepared = std::pin::pin!(prepared);
        while let Some(frame) = prepared.next().await {
            self.pipeline.push_prepared(frame?)?;
        }
        self.pipeline.finish()
    }
}

async fn run_on_worker<F>(index: u64, job: F) -> Result<GrayFrame>
where
    F: FnOnce() -> Result<GrayFrame> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| ChamberError::Worker(format!("frame {index}: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FrameRef;
    use image::{DynamicImage, GrayImage, Luma};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> Config {
        Config {
            scale_factor: 0.5,
            blur_size: 3,
            bg_batch_size: 10,
            bg_jump: 10,
            min_threshold: 0.0,
            min_contour_size: 20.0,
            track_distance: 10.0,
            prints: false,
            ..Config::default()
        }
    }

    fn frame(i: u64) -> Frame {
        let image = GrayImage::from_fn(240, 120, |x, y| {
            let start = 20 + 6 * i as u32;
            if i > 0 && (start..start + 100).contains(&x) && (40..52).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        Frame::new(
            DynamicImage::ImageLuma8(image),
            FrameRef::new(i, Duration::from_millis(i * 40), "t"),
        )
    }

    fn frames() -> Vec<Result<Frame>> {
        (0..10u64).map(|i| Ok(frame(i))).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn matches_the_sequential_pipeline() {
        let sequential = DetectionPipeline::new(config()).unwrap().process(frames()).unwrap();
        let parallel = ParallelPipeline::with_workers(config(), 4)
            .unwrap()
            .process(frames())
            .await
            .unwrap();
        assert!(!sequential.is_empty());
        assert_eq!(parallel, sequential);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn indexed_reads_happen_on_the_workers() {
        let sequential = DetectionPipeline::new(config()).unwrap().process(frames()).unwrap();
        let runtime_thread = std::thread::current().id();
        let off_runtime = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&off_runtime);
        let parallel = ParallelPipeline::with_workers(config(), 4)
            .unwrap()
            .process_indexed(10, move |i| {
                if std::thread::current().id() != runtime_thread {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(frame(i))
            })
            .await
            .unwrap();
        assert_eq!(parallel, sequential);
        assert_eq!(off_runtime.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn indexed_read_error_stops_the_run() {
        let result = ParallelPipeline::with_workers(config(), 2)
            .unwrap()
            .process_indexed(10, |i| {
                if i == 4 { Err(ChamberError::FrameNotFound(i)) } else { Ok(frame(i)) }
            })
            .await;
        assert!(matches!(result, Err(ChamberError::FrameNotFound(4))));
    }

    #[tokio::test]
    async fn worker_count_is_at_least_one() {
        let pipeline = ParallelPipeline::with_workers(config(), 0).unwrap();
        assert_eq!(pipeline.workers(), 1);
    }

    #[tokio::test]
    async fn source_error_stops_the_run() {
        let mut input = frames();
        input.insert(3, Err(ChamberError::FrameNotFound(3)));
        let result = ParallelPipeline::new(config()).unwrap().process(input).await;
        assert!(matches!(result, Err(ChamberError::FrameNotFound(3))));
    }
}
