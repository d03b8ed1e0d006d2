//! Watcher-to-queue wiring and worker loops for the sidecar.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use exportd_common::crd::NfsExportContent;
use exportd_common::keys;

use crate::controller::SidecarController;

/// Run the sidecar: content watcher, periodic resync, and `workers` worker
/// loops, until the stop future resolves.
pub async fn run(
    controller: Arc<SidecarController>,
    client: Client,
    workers: usize,
    resync_period: Duration,
    stop: impl std::future::Future<Output = ()>,
) {
    info!(workers, "Starting sidecar reconciler");

    let watch_task = tokio::spawn(watch_contents(Arc::clone(&controller), client));
    let resync_task = tokio::spawn(resync_loop(Arc::clone(&controller), resync_period));

    let mut worker_tasks = Vec::new();
    for _ in 0..workers.max(1) {
        worker_tasks.push(tokio::spawn(worker(Arc::clone(&controller))));
    }

    stop.await;
    info!("Shutting down sidecar reconciler");

    controller.queue().shut_down();
    watch_task.abort();
    resync_task.abort();
    for task in worker_tasks {
        let _ = task.await;
    }
}

/// One worker: dequeue, reconcile, rate-limited retry on error.
async fn worker(controller: Arc<SidecarController>) {
    let queue = controller.queue();
    while let Some(key) = queue.get().await {
        match controller.sync_key(&key).await {
            Ok(()) => queue.forget(&key),
            Err(e) => {
                if e.is_conflict() {
                    debug!(key, error = %e, "could not sync content");
                } else {
                    warn!(key, error = %e, "could not sync content, will retry");
                }
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
}

/// Feed watch events into the cache and queue.
///
/// One update shape is deliberately not enqueued: a content whose
/// `status.error` is set and whose `being-created` annotation just went away.
/// That update is the sidecar's own annotation removal after a final create
/// error; enqueueing it would re-run CreateExport immediately instead of
/// through the rate limiter's backoff.
async fn watch_contents(controller: Arc<SidecarController>, client: Client) {
    let contents: Api<NfsExportContent> = Api::all(client);
    let mut had_being_created: HashMap<String, bool> = HashMap::new();

    let mut stream = std::pin::pin!(watcher(contents, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(content)) | Ok(Event::InitApply(content)) => {
                let key = content.name_any();
                let has_annotation = keys::has_annotation(
                    content.metadata.annotations.as_ref(),
                    keys::ANN_BEING_CREATED,
                );
                let has_error = content
                    .status
                    .as_ref()
                    .map(|s| s.error.is_some())
                    .unwrap_or(false);
                let annotation_just_removed =
                    !has_annotation && had_being_created.get(&key).copied().unwrap_or(false);
                had_being_created.insert(key.clone(), has_annotation);

                // Stale versions are dropped at the cache.
                if !controller.store_update(&content) {
                    continue;
                }
                if has_error && annotation_just_removed {
                    debug!(key, "skipping enqueue after final create error");
                    continue;
                }
                controller.queue().add(&key);
            }
            Ok(Event::Delete(content)) => {
                let key = content.name_any();
                had_being_created.remove(&key);
                controller.store_remove(&key);
                debug!(key, "content deleted");
            }
            Ok(Event::Init) | Ok(Event::InitDone) => {}
            Err(e) => {
                warn!(error = %e, "content watch error");
            }
        }
    }
}

/// Re-enqueue every cached content periodically so missed events and the
/// backoff heuristic cannot park an object forever.
async fn resync_loop(controller: Arc<SidecarController>, period: Duration) {
    if period.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for key in controller.cached_keys() {
            controller.queue().add(&key);
        }
    }
}
