//! Watcher wiring and worker loops for the common reconciler.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use exportd_common::crd::{NfsExport, NfsExportContent};

use crate::controller::CommonController;

/// Run the common reconciler: two watchers, two worker pools and the
/// periodic resync, until the stop future resolves.
pub async fn run(
    controller: Arc<CommonController>,
    client: Client,
    workers: usize,
    resync_period: Duration,
    stop: impl std::future::Future<Output = ()>,
) {
    info!(workers, "Starting common reconciler");

    let watch_exports = tokio::spawn(watch_exports(Arc::clone(&controller), client.clone()));
    let watch_contents = tokio::spawn(watch_contents(Arc::clone(&controller), client));
    let resync = tokio::spawn(resync_loop(Arc::clone(&controller), resync_period));

    let mut worker_tasks = Vec::new();
    for _ in 0..workers.max(1) {
        worker_tasks.push(tokio::spawn(export_worker(Arc::clone(&controller))));
        worker_tasks.push(tokio::spawn(content_worker(Arc::clone(&controller))));
    }

    stop.await;
    info!("Shutting down common reconciler");

    controller.export_queue().shut_down();
    controller.content_queue().shut_down();
    watch_exports.abort();
    watch_contents.abort();
    resync.abort();
    for task in worker_tasks {
        let _ = task.await;
    }
}

async fn export_worker(controller: Arc<CommonController>) {
    let queue = controller.export_queue();
    while let Some(key) = queue.get().await {
        match controller.sync_export_key(&key).await {
            Ok(()) => queue.forget(&key),
            Err(e) => {
                if e.is_conflict() {
                    debug!(key, error = %e, "could not sync export");
                } else {
                    warn!(key, error = %e, "could not sync export, will retry");
                }
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
}

async fn content_worker(controller: Arc<CommonController>) {
    let queue = controller.content_queue();
    while let Some(key) = queue.get().await {
        match controller.sync_content_key(&key).await {
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

async fn watch_exports(controller: Arc<CommonController>, client: Client) {
    let exports: Api<NfsExport> = Api::all(client);
    let mut stream = std::pin::pin!(watcher(exports, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(export)) | Ok(Event::InitApply(export)) => {
                let key = export.key();
                if controller.store_export(&export) {
                    controller.export_queue().add(&key);
                }
            }
            Ok(Event::Delete(export)) => {
                debug!(export = %export.key(), "export deleted");
                controller.on_export_deleted(&export);
            }
            Ok(Event::Init) | Ok(Event::InitDone) => {}
            Err(e) => warn!(error = %e, "export watch error"),
        }
    }
}

async fn watch_contents(controller: Arc<CommonController>, client: Client) {
    let contents: Api<NfsExportContent> = Api::all(client);
    let mut stream = std::pin::pin!(watcher(contents, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(content)) | Ok(Event::InitApply(content)) => {
                let key = content.name_any();
                if controller.store_content(&content) {
                    controller.content_queue().add(&key);
                }
            }
            Ok(Event::Delete(content)) => {
                debug!(content = %content.name_any(), "content deleted");
                controller.on_content_deleted(&content);
            }
            Ok(Event::Init) | Ok(Event::InitDone) => {}
            Err(e) => warn!(error = %e, "content watch error"),
        }
    }
}

async fn resync_loop(controller: Arc<CommonController>, period: Duration) {
    if period.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for key in controller.cached_export_keys() {
            controller.export_queue().add(&key);
        }
        for key in controller.cached_content_keys() {
            controller.content_queue().add(&key);
        }
    }
}
