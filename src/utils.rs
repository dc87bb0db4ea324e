// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::MutexGuard;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;

/// How long a blocked thread sleeps before re-checking the exit flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Global cancellation flag shared by every component of an encoder instance. Once raised, all
/// wait loops unwind with [`EncodeError::Cancelled`] instead of blocking.
#[derive(Clone, Debug, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Blocks on `cond` until `pred` holds for the guarded value.
///
/// The predicate is re-evaluated after every wake-up and at least every [`POLL_INTERVAL`], so
/// neither a lost notification nor a raised `exit` flag can leave the caller blocked.
pub(crate) fn wait_until<'a, T>(
    mut guard: MutexGuard<'a, T>,
    cond: &Condvar,
    exit: &ExitFlag,
    mut pred: impl FnMut(&mut T) -> bool,
) -> EncodeResult<MutexGuard<'a, T>> {
    loop {
        if pred(&mut guard) {
            return Ok(guard);
        }

        if exit.is_raised() {
            return Err(EncodeError::Cancelled);
        }

        guard = cond.wait_timeout(guard, POLL_INTERVAL).unwrap().0;
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of named threads executing jobs in submission order.
///
/// Jobs are dequeued in FIFO order, which is what lets dependent jobs (eg. LCU rows waiting on the
/// row above) share the pool without deadlocking: every job a running job waits on was dequeued
/// before it.
pub(crate) struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `num_threads` workers. A panicking job raises `exit` so that the rest of the
    /// pipeline unwinds instead of waiting for work that will never complete.
    pub(crate) fn new(name: &str, num_threads: usize, exit: ExitFlag) -> EncodeResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let receiver = receiver.clone();
            let exit = exit.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            log::error!("worker job panicked, shutting the pipeline down");
                            exit.raise();
                        }
                    }
                })
                .map_err(EncodeError::SpawnFailed)?;

            workers.push(worker);
        }

        log::debug!("started {num_threads} {name} workers");

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers,
        })
    }

    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) -> EncodeResult<()> {
        self.sender
            .as_ref()
            .ok_or(EncodeError::InvalidInternalState)?
            .send(Box::new(job))
            .map_err(|_| EncodeError::InvalidInternalState)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel makes every worker leave its loop once the queue is empty.
        self.sender.take();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("{} worker exited abnormally", self.name);
            }
        }
    }
}
