//! Cancellable downloads of a block range.
//!
//! A download runs as its own task. It registers a want with every peer,
//! tries one bulk range request, then fetches whatever is still missing one
//! block at a time: in order when `linear`, otherwise with bounded
//! parallelism. Cancelling (or dropping the handle) stops it between
//! blocks; blocks already verified stay stored.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::requests::RequestKey;
use crate::error::{LogError, LogResult};
use crate::log::Shared;

/// What a finished download did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RangeSummary {
    /// Blocks fetched from peers by this download.
    pub downloaded: u64,
    /// Blocks that were already held when it started.
    pub already_held: u64,
}

/// Handle to a running download. Dropping it cancels the download.
#[derive(Debug)]
pub struct RangeHandle {
    start: u64,
    end: u64,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<LogResult<RangeSummary>>>,
}

impl RangeHandle {
    pub(crate) fn spawn(shared: Arc<Shared>, start: u64, end: u64, linear: bool) -> Self {
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(run(shared, start, end, linear, cancelled));
        Self {
            start,
            end,
            cancel,
            task: Some(task),
        }
    }

    pub fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    /// Stop the download. [`RangeHandle::wait`] then returns `Cancelled`.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait for the download to finish.
    pub async fn wait(mut self) -> LogResult<RangeSummary> {
        let Some(task) = self.task.take() else {
            return Err(LogError::Cancelled);
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(LogError::Cancelled),
            Err(e) => Err(LogError::Unavailable(format!("download task failed: {e}"))),
        }
    }
}

impl Drop for RangeHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.cancel.send(true);
        }
    }
}

/// Resolves once cancellation is requested.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Handle consumed by `wait`; nobody can cancel any more.
            std::future::pending::<()>().await;
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    start: u64,
    end: u64,
    linear: bool,
    mut cancel: watch::Receiver<bool>,
) -> LogResult<RangeSummary> {
    let span = end.saturating_sub(start);
    shared.replicator.send_want(start, span);
    let result = tokio::select! {
        result = fetch(&shared, start, end, linear) => result,
        _ = cancelled(&mut cancel) => Err(LogError::Cancelled),
    };
    shared.replicator.cancel_want(start, span);
    match &result {
        Ok(summary) => info!(start, end, downloaded = summary.downloaded, "range download finished"),
        Err(e) => debug!(start, end, error = %e, "range download stopped"),
    }
    result
}

fn held(shared: &Shared, start: u64, end: u64) -> u64 {
    let core = shared.core.lock();
    let end = end.min(core.state().length);
    if start >= end {
        return 0;
    }
    core.bitfield().count_ones(start, end)
}

fn missing(shared: &Shared, start: u64, end: u64) -> Vec<u64> {
    let core = shared.core.lock();
    (start..end).filter(|i| !core.has(*i)).collect()
}

async fn fetch(shared: &Shared, start: u64, end: u64, linear: bool) -> LogResult<RangeSummary> {
    let already_held = held(shared, start, end);
    let timeout = shared.replicator.config().request_timeout;

    if !linear && end > start && already_held < end - start {
        // Only taken when one peer claims the whole range.
        match shared
            .replicator
            .request(shared, RequestKey::Range { start, end }, timeout)
            .await
        {
            Ok(_) => {}
            Err(LogError::Unavailable(reason)) => debug!(start, end, reason = %reason, "no bulk source"),
            Err(e) => return Err(e),
        }
    }

    let todo = missing(shared, start, end);
    if linear {
        for index in todo {
            shared.fetch_block(index, timeout).await?;
        }
    } else {
        let parallelism = shared.replicator.config().range_parallelism.max(1);
        let mut fetches = stream::iter(todo)
            .map(|index| shared.fetch_block(index, timeout))
            .buffer_unordered(parallelism);
        while let Some(result) = fetches.next().await {
            result?;
        }
    }

    Ok(RangeSummary {
        downloaded: held(shared, start, end).saturating_sub(already_held),
        already_held,
    })
}
