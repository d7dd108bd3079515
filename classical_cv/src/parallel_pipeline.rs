// THEORY:
// `Dispatcher::process` is synchronous and CPU-bound. The pool lets async callers
// (the server, batch runs in the CLI) fan requests out without blocking their
// runtime: one router task deals requests round-robin to a fixed set of worker
// tasks, each worker runs its request on the blocking thread pool, and the answer
// travels back on a per-request oneshot channel.
//
// The dispatcher itself is shared, immutable and stateless, so workers need no
// coordination beyond their own queue.

use crate::core_modules::params::ParameterSet;
use crate::error::{DispatchError, DispatchResult};
use crate::pipeline::{Dispatcher, Processed};
use image::DynamicImage;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// One queued request.
pub struct DispatchTask {
    pub category: String,
    pub name: String,
    pub image: Option<Arc<DynamicImage>>,
    pub params: ParameterSet,
    pub result_sender: oneshot::Sender<DispatchResult<Processed>>,
}

pub struct DispatchPool {
    dispatcher: Arc<Dispatcher>,
    task_sender: mpsc::UnboundedSender<DispatchTask>,
    router: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatchPool {
    /// Spawns the router and `dispatcher.config().workers` workers on the current
    /// tokio runtime.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let worker_count = dispatcher.config().workers.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<DispatchTask>();

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) =
            (0..worker_count).map(|_| mpsc::unbounded_channel::<DispatchTask>()).unzip();

        let router = tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                // A closed worker queue drops the task, and with it the reply sender.
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_count;
            }
        });

        let workers = worker_receivers
            .into_iter()
            .enumerate()
            .map(|(worker, mut worker_receiver)| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    while let Some(task) = worker_receiver.recv().await {
                        let DispatchTask { category, name, image, params, result_sender } = task;
                        let dispatcher = Arc::clone(&dispatcher);
                        tracing::trace!(worker, %category, %name, "picked up request");
                        let result = tokio::task::spawn_blocking(move || {
                            dispatcher.process(&category, &name, image.as_deref(), &params)
                        })
                        .await
                        .unwrap_or(Err(DispatchError::WorkerUnavailable));
                        let _ = result_sender.send(result);
                    }
                })
            })
            .collect();

        tracing::debug!(workers = worker_count, "dispatch pool started");
        Self { dispatcher, task_sender, router, workers }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queues a request and waits for its answer.
    pub async fn submit(
        &self,
        category: impl Into<String>,
        name: impl Into<String>,
        image: Option<Arc<DynamicImage>>,
        params: ParameterSet,
    ) -> DispatchResult<Processed> {
        let (result_sender, result_receiver) = oneshot::channel();
        let task = DispatchTask { category: category.into(), name: name.into(), image, params, result_sender };

        self.task_sender.send(task).map_err(|_| DispatchError::WorkerUnavailable)?;

        result_receiver.await.map_err(|_| DispatchError::WorkerUnavailable)?
    }

    /// Stops routing. Queued and later requests fail with `WorkerUnavailable`;
    /// requests already running on a worker still complete.
    pub fn shutdown(&self) {
        self.router.abort();
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.router.abort();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::library::ImageprocLibrary;
    use crate::pipeline::DispatcherConfig;
    use futures::future::join_all;
    use image::{Rgb, RgbImage};

    fn pool(workers: usize) -> DispatchPool {
        let config = DispatcherConfig { cascade_dir: None, workers };
        let dispatcher = Dispatcher::with_library(Arc::new(ImageprocLibrary::new()), config).unwrap();
        DispatchPool::new(Arc::new(dispatcher))
    }

    fn picture() -> Arc<DynamicImage> {
        Arc::new(DynamicImage::ImageRgb8(RgbImage::from_fn(40, 30, |x, y| Rgb([(x * 6) as u8, (y * 8) as u8, 50]))))
    }

    #[tokio::test]
    async fn answers_concurrent_requests() {
        let pool = pool(3);
        assert_eq!(pool.worker_count(), 3);
        let image = picture();
        let names = ["Gaussian Blur", "Median Filter", "Sharpening", "Histogram Equalization", "Gamma Correction"];
        let results = join_all(names.iter().map(|name| {
            pool.submit("Image Processing", *name, Some(Arc::clone(&image)), ParameterSet::new())
        }))
        .await;
        for (name, result) in names.iter().zip(results) {
            let processed = result.unwrap();
            assert_eq!(processed.requested.name(), *name);
            assert_eq!(processed.image.dimensions(), (40, 30));
        }
    }

    #[tokio::test]
    async fn errors_come_back_through_the_pool() {
        let pool = pool(2);
        let result = pool.submit("Image Processing", "Gaussian Blur", None, ParameterSet::new()).await;
        assert_eq!(result, Err(DispatchError::MissingInput));
    }

    #[tokio::test]
    async fn shut_down_pool_refuses_work() {
        let pool = pool(1);
        pool.shutdown();
        tokio::task::yield_now().await;
        let result = pool.submit("Image Processing", "Gaussian Blur", Some(picture()), ParameterSet::new()).await;
        assert_eq!(result, Err(DispatchError::WorkerUnavailable));
    }
}
