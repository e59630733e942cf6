//! Fixed-size worker pools connected by bounded queues.

use std::future::Future;
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

/// Spawned workers of one stage.
pub(crate) struct StageHandle {
    name: &'static str,
    handles: Vec<JoinHandle<()>>,
}

impl StageHandle {
    /// Wait for every worker to exit.
    pub(crate) async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("{} worker task failed: {}", self.name, e);
            }
        }
        debug!("{} stage drained", self.name);
    }
}

/// Spawn `workers` tasks that take items from `input`, run `work` on each
/// and forward every produced output to `output`.
///
/// Workers stop taking items once `cancel` fires; an item already taken is
/// still processed and its outputs forwarded. `output` closes when the last
/// worker exits.
pub(crate) fn spawn_stage<I, O, F, Fut>(
    name: &'static str,
    workers: usize,
    input: Receiver<I>,
    output: Sender<O>,
    cancel: CancellationToken,
    work: F,
) -> StageHandle
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<O>> + Send + 'static,
{
    let work = Arc::new(work);
    let mut handles = Vec::with_capacity(workers);

    for worker_id in 0..workers.max(1) {
        let input = input.clone();
        let output = output.clone();
        let cancel = cancel.clone();
        let work = work.clone();

        let handle = tokio::spawn(
            async move {
                let mut processed = 0usize;
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        item = input.recv() => match item {
                            Ok(item) => item,
                            Err(_) => break,
                        },
                    };

                    for produced in work(item).await {
                        if output.send(produced).await.is_err() {
                            debug!("{} worker {}: downstream closed", name, worker_id);
                            return;
                        }
                    }
                    processed += 1;
                }
                debug!("{} worker {}: processed {} items", name, worker_id, processed);
            }
            .in_current_span(),
        );
        handles.push(handle);
    }

    StageHandle { name, handles }
}

/// Push `items` into the first queue of a pipeline, then close it.
pub(crate) fn spawn_feeder<T>(items: Vec<T>, tx: Sender<T>, cancel: CancellationToken) -> JoinHandle<()>
where
    T: Send + 'static,
{
    tokio::spawn(
        async move {
            for item in items {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        .in_current_span(),
    )
}
