// THEORY:
// The `LoaderPool` keeps the numeric core fed. Decoding and resizing image files is
// I/O- and codec-bound work with no shared state, so it runs on a bounded pool of
// tokio workers ahead of the rayon-parallel scoring.
//
// Key architectural principles:
// 1.  **Dispatcher + workers**: a single dispatcher task hands requests to the workers
//     round-robin over per-worker channels; every request carries a `oneshot` sender
//     for its own reply.
// 2.  **Bounded everywhere**: all channels are bounded, so a caller submitting a whole
//     dataset gets backpressure instead of an unbounded queue of decoded images.
// 3.  **Read-only workers**: workers only read files and produce tensors. They never
//     see the memory bank or the model state.
// 4.  **Blocking work off the reactor**: decoding runs in `spawn_blocking`, so slow
//     codecs cannot stall the async workers.

use crate::core_modules::tensor::tensor::{Tensor3, from_dynamic_image, mask_from_dynamic_image};
use crate::error::{InspectError, Result};
use futures::future::join_all;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const QUEUE_DEPTH: usize = 4;

/// How decoded images are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeSettings {
    pub channels: usize,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
enum LoadJob {
    Image,
    Mask,
}

enum Loaded {
    Image(Result<Tensor3>),
    Mask(Result<Array2<bool>>),
}

struct LoadTask {
    path: PathBuf,
    job: LoadJob,
    reply: oneshot::Sender<Loaded>,
}

/// One decoded input file.
#[derive(Debug)]
pub struct LoadedImage {
    pub path: PathBuf,
    pub tensor: Result<Tensor3>,
}

fn decode(path: &Path, job: LoadJob, settings: DecodeSettings) -> Loaded {
    let opened = image::open(path).map_err(InspectError::from);
    match job {
        LoadJob::Image => Loaded::Image(
            opened.and_then(|img| from_dynamic_image(&img, settings.channels, settings.size)),
        ),
        LoadJob::Mask => Loaded::Mask(opened.map(|img| mask_from_dynamic_image(&img, settings.size))),
    }
}

pub struct LoaderPool {
    task_sender: mpsc::Sender<LoadTask>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    settings: DecodeSettings,
}

impl LoaderPool {
    /// Spawns `workers` loader tasks. Must be called inside a tokio runtime.
    pub fn new(workers: usize, settings: DecodeSettings) -> Self {
        let worker_count = workers.max(1);
        let (task_sender, mut task_receiver) = mpsc::channel::<LoadTask>(worker_count * QUEUE_DEPTH);

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::channel::<LoadTask>(QUEUE_DEPTH))
            .unzip();

        let dispatcher = tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                if worker_senders[worker_idx].send(task).await.is_err() {
                    break;
                }
                worker_idx = (worker_idx + 1) % worker_senders.len();
            }
        });

        let workers = worker_receivers
            .into_iter()
            .enumerate()
            .map(|(worker_id, mut receiver)| {
                tokio::spawn(async move {
                    while let Some(LoadTask { path, job, reply }) = receiver.recv().await {
                        let shown = path.display().to_string();
                        let loaded = tokio::task::spawn_blocking(move || decode(&path, job, settings))
                            .await
                            .unwrap_or_else(|e| {
                                let reason = InspectError::data(format!("decode of {shown} did not finish: {e}"));
                                match job {
                                    LoadJob::Image => Loaded::Image(Err(reason)),
                                    LoadJob::Mask => Loaded::Mask(Err(reason)),
                                }
                            });
                        let _ = reply.send(loaded);
                    }
                    tracing::debug!(worker_id, "loader worker stopped");
                })
            })
            .collect();

        tracing::debug!(workers = worker_count, "loader pool started");
        Self {
            task_sender,
            dispatcher,
            workers,
            settings,
        }
    }

    pub fn settings(&self) -> DecodeSettings {
        self.settings
    }

    async fn submit(&self, path: PathBuf, job: LoadJob) -> Result<Loaded> {
        let (reply, result_receiver) = oneshot::channel();
        self.task_sender
            .send(LoadTask { path, job, reply })
            .await
            .map_err(|_| InspectError::data("loader pool is closed"))?;
        result_receiver
            .await
            .map_err(|_| InspectError::data("loader worker dropped the request"))
    }

    pub async fn load_image(&self, path: PathBuf) -> LoadedImage {
        let tensor = match self.submit(path.clone(), LoadJob::Image).await {
            Ok(Loaded::Image(result)) => result,
            Ok(Loaded::Mask(_)) => Err(InspectError::data("loader answered with a mask")),
            Err(e) => Err(e),
        };
        if let Err(e) = &tensor {
            tracing::warn!(path = %path.display(), error = %e, "image could not be loaded");
        }
        LoadedImage { path, tensor }
    }

    /// Decodes every path, preserving order.
    pub async fn load_images(&self, paths: &[PathBuf]) -> Vec<LoadedImage> {
        join_all(paths.iter().cloned().map(|p| self.load_image(p))).await
    }

    /// Decodes a ground-truth mask; `None` yields an all-normal mask.
    pub async fn load_mask(&self, path: Option<PathBuf>) -> Result<Array2<bool>> {
        let side = self.settings.size as usize;
        let Some(path) = path else {
            return Ok(Array2::from_elem((side, side), false));
        };
        match self.submit(path, LoadJob::Mask).await? {
            Loaded::Mask(result) => result,
            Loaded::Image(_) => Err(InspectError::data("loader answered with an image")),
        }
    }

    pub async fn load_masks(&self, paths: &[Option<PathBuf>]) -> Vec<Result<Array2<bool>>> {
        join_all(paths.iter().cloned().map(|p| self.load_mask(p))).await
    }

    /// Closes the queue and waits for every worker to drain.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        let _ = self.dispatcher.await;
        join_all(self.workers).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage, GrayImage};

    #[tokio::test]
    async fn loads_in_order_and_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for shade in [0u8, 128, 255] {
            let path = dir.path().join(format!("img_{shade}.png"));
            RgbImage::from_pixel(8, 8, Rgb([shade, shade, shade])).save(&path).unwrap();
            paths.push(path);
        }
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not an image").unwrap();
        paths.insert(1, broken);

        let pool = LoaderPool::new(2, DecodeSettings { channels: 3, size: 4 });
        let loaded = pool.load_images(&paths).await;
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[0].tensor.as_ref().unwrap()[[0, 0, 0]], -1.0);
        assert!(loaded[1].tensor.as_ref().is_err_and(|e| e.is_per_sample()));
        assert_eq!(loaded[3].tensor.as_ref().unwrap().dim(), (3, 4, 4));
        assert_eq!(loaded[3].path, paths[3]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn missing_mask_is_all_normal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        GrayImage::from_fn(4, 4, |x, _| if x < 2 { Luma([0]) } else { Luma([255]) })
            .save(&path)
            .unwrap();
        let pool = LoaderPool::new(1, DecodeSettings { channels: 3, size: 4 });
        let masks = pool.load_masks(&[None, Some(path)]).await;
        assert!(masks[0].as_ref().unwrap().iter().all(|m| !m));
        let mask = masks[1].as_ref().unwrap();
        assert!(!mask[[0, 0]]);
        assert!(mask[[0, 3]]);
        pool.shutdown().await;
    }
}
