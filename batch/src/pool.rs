//! Fixed-size worker pool over a shared queue.
//!
//! Workers pull the next item until the queue drains or the cancellation
//! token fires. Items already running when cancellation arrives finish
//! normally. A panicking item is caught and counted so it never takes the
//! rest of the pool with it.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread;

use agent::cancel::CancelToken;
use anyhow::{Result, anyhow};
use tracing::{debug, error};

/// What happened to the items handed to [`run_pool`].
#[derive(Debug)]
pub struct PoolReport<R> {
    /// Results in completion order.
    pub results: Vec<R>,
    /// Items never started because of cancellation.
    pub skipped: usize,
    pub panicked: usize,
}

/// Run `work` over `items` on at most `workers` threads.
pub fn run_pool<T, R, F>(
    items: Vec<T>,
    workers: usize,
    cancel: &CancelToken,
    work: F,
) -> Result<PoolReport<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    let workers = workers.max(1).min(total.max(1));
    let queue = Mutex::new(items.into_iter().collect::<VecDeque<T>>());
    let results = Mutex::new(Vec::with_capacity(total));
    let panicked = Mutex::new(0usize);

    thread::scope(|scope| -> Result<()> {
        for index in 0..workers {
            let queue = &queue;
            let results = &results;
            let panicked = &panicked;
            let work = &work;
            thread::Builder::new()
                .name(format!("batch-worker-{index}"))
                .spawn_scoped(scope, move || {
                    loop {
                        if cancel.is_cancelled() {
                            debug!(worker = index, "cancelled; worker stopping");
                            break;
                        }
                        let next = queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .pop_front();
                        let Some(item) = next else {
                            break;
                        };
                        match panic::catch_unwind(AssertUnwindSafe(|| work(item))) {
                            Ok(result) => results
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(result),
                            Err(payload) => {
                                error!(worker = index, panic = %panic_message(&*payload), "work item panicked");
                                *panicked.lock().unwrap_or_else(PoisonError::into_inner) += 1;
                            }
                        }
                    }
                })
                .map_err(|err| anyhow!("failed to spawn worker thread: {err}"))?;
        }
        Ok(())
    })?;

    let skipped = queue.into_inner().unwrap_or_else(PoisonError::into_inner).len();
    Ok(PoolReport {
        results: results.into_inner().unwrap_or_else(PoisonError::into_inner),
        skipped,
        panicked: panicked.into_inner().unwrap_or_else(PoisonError::into_inner),
    })
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
