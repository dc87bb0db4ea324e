// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wavefront (WPP) encoding of the LCU rows of a picture.
//!
//! Every row of a picture is a separate job of the row worker pool. A row job waits on two
//! things before coding an LCU:
//!
//! * the row above must be at least two LCUs ahead, so that the above and above-right
//!   neighbours are reconstructed;
//! * the rows of every reference picture within the motion search window must be fully
//!   reconstructed, filtered and padded.
//!
//! The entropy coder state after the second LCU of a row is handed over to the row below, so
//! the coded bits do not depend on how the rows were spread over threads.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::backend::EncoderBackend;
use crate::backend::LcuContext;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::scheduler::FrameJob;
use crate::scheduler::Shared;
use crate::utils::wait_until;
use crate::utils::ExitFlag;

/// Position of a row inside its slice.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RowKind {
    SliceStart,
    Normal,
    SliceEnd,
    /// The slice is made of this single row
    WholeSlice,
}

impl RowKind {
    pub fn new(first: bool, last: bool) -> Self {
        match (first, last) {
            (true, true) => RowKind::WholeSlice,
            (true, false) => RowKind::SliceStart,
            (false, true) => RowKind::SliceEnd,
            (false, false) => RowKind::Normal,
        }
    }

    pub fn starts_slice(&self) -> bool {
        matches!(self, RowKind::SliceStart | RowKind::WholeSlice)
    }

    pub fn ends_slice(&self) -> bool {
        matches!(self, RowKind::SliceEnd | RowKind::WholeSlice)
    }
}

struct RowState<S> {
    /// Number of LCUs coded, from the left
    coded: usize,
    /// Entropy state handed over to the next row of the slice
    entropy: Option<S>,
    /// Coded bits of the row, available once every LCU is coded
    bitstream: Option<Vec<u8>>,
}

/// Progress of one LCU row of a picture.
pub(crate) struct RowSlot<S> {
    pub(crate) kind: RowKind,
    pub(crate) slice: usize,
    state: Mutex<RowState<S>>,
    cond: Condvar,
}

impl<S> RowSlot<S> {
    pub(crate) fn new(kind: RowKind, slice: usize) -> Self {
        Self {
            kind,
            slice,
            state: Mutex::new(RowState {
                coded: 0,
                entropy: None,
                bitstream: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, RowState<S>> {
        self.state.lock().unwrap()
    }

    pub(crate) fn coded(&self) -> usize {
        self.state().coded
    }

    pub(crate) fn set_coded(&self, coded: usize) {
        let mut state = self.state();
        state.coded = state.coded.max(coded);
        drop(state);

        self.cond.notify_all();
    }

    /// Blocks until at least `coded` LCUs of the row are coded.
    pub(crate) fn wait_coded(&self, coded: usize, exit: &ExitFlag) -> EncodeResult<()> {
        let _state = wait_until(self.state(), &self.cond, exit, |state| state.coded >= coded)?;
        Ok(())
    }

    pub(crate) fn store_entropy(&self, entropy: S) {
        self.state().entropy = Some(entropy);
        self.cond.notify_all();
    }

    /// Takes the entropy state stored by [`RowSlot::store_entropy`], waiting for it.
    pub(crate) fn take_entropy(&self, exit: &ExitFlag) -> EncodeResult<S> {
        let mut state = wait_until(self.state(), &self.cond, exit, |state| {
            state.entropy.is_some()
        })?;

        state
            .entropy
            .take()
            .ok_or(EncodeError::InvalidInternalState)
    }

    /// Stores the bits of the row and marks all of its `cols` LCUs as coded.
    pub(crate) fn finish(&self, bitstream: Vec<u8>, cols: usize) {
        let mut state = self.state();
        state.bitstream = Some(bitstream);
        state.coded = cols;
        drop(state);

        self.cond.notify_all();
    }

    pub(crate) fn take_bitstream(&self) -> Option<Vec<u8>> {
        self.state().bitstream.take()
    }
}

/// A row context. Statistics only, the coding state itself travels with the row.
#[derive(Debug)]
pub(crate) struct RowContext {
    pub(crate) id: usize,
    pub(crate) rows_coded: u64,
}

/// The M row contexts shared by every picture in flight.
pub(crate) struct RowContextPool {
    free: Mutex<Vec<RowContext>>,
    cond: Condvar,
}

impl RowContextPool {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            free: Mutex::new(
                (0..count)
                    .rev()
                    .map(|id| RowContext { id, rows_coded: 0 })
                    .collect(),
            ),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self, exit: &ExitFlag) -> EncodeResult<RowContextGuard<'_>> {
        let free = self.free.lock().unwrap();
        let mut free = wait_until(free, &self.cond, exit, |free| !free.is_empty())?;

        Ok(RowContextGuard {
            pool: self,
            context: free.pop(),
        })
    }

    pub(crate) fn num_free(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// Returns the row context to its pool when dropped.
pub(crate) struct RowContextGuard<'a> {
    pool: &'a RowContextPool,
    context: Option<RowContext>,
}

impl RowContextGuard<'_> {
    fn row_done(&mut self) {
        if let Some(context) = self.context.as_mut() {
            context.rows_coded += 1;
            log::trace!(
                "row context {} coded {} rows",
                context.id,
                context.rows_coded
            );
        }
    }
}

impl Drop for RowContextGuard<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.free.lock().unwrap().push(context);
            self.pool.cond.notify_all();
        }
    }
}

/// Codes LCU row `row` of `job`, then filters and publishes every row that became ready.
pub(crate) fn encode_row<B: EncoderBackend>(
    shared: &Shared<B>,
    job: &FrameJob<B::EntropyState>,
    row: usize,
) -> EncodeResult<()> {
    let exit = &shared.exit;
    let mut context = shared.row_contexts.acquire(exit)?;
    log::trace!(
        "coi={} row {row} started, {} row contexts left",
        job.info.coi,
        shared.row_contexts.num_free()
    );

    let geometry = *job.frame.geometry();
    let cols = geometry.cols;
    let slot = &job.rows[row];

    for reference in &job.refs {
        reference.wait_rows(geometry.reference_rows(row), exit)?;
    }

    let mut state = if slot.kind.starts_slice() {
        shared.backend.init_entropy(&job.info, slot.slice)
    } else {
        job.rows[row - 1].take_entropy(exit)?
    };

    let hand_over = !slot.kind.ends_slice();
    let snapshot_col = (cols - 1).min(1);
    let mut out = vec![];

    for col in 0..cols {
        if row > 0 {
            job.rows[row - 1].wait_coded((col + 2).min(cols), exit)?;
        }

        let ctx = LcuContext {
            info: &job.info,
            frame: &job.frame,
            refs: &job.refs,
            row,
            col,
        };
        shared.backend.encode_lcu(&ctx, &mut state, &mut out)?;

        if hand_over && col == snapshot_col {
            slot.store_entropy(state.clone());
        }

        if col + 1 < cols {
            slot.set_coded(col + 1);
        }
    }

    if slot.kind.ends_slice() {
        shared.backend.finish_slice(state, &mut out)?;
    }

    log::trace!(
        "coi={} row {row} coded, {} bytes",
        job.info.coi,
        out.len()
    );

    slot.finish(out, cols);
    if slot.kind.ends_slice() {
        job.seal_slice(slot.slice, row)?;
    }

    job.row_coded();
    context.row_done();
    drop(context);

    job.filter_ready_rows(&shared.backend)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(RowKind::new(true, true), RowKind::WholeSlice);
        assert!(RowKind::WholeSlice.starts_slice() && RowKind::WholeSlice.ends_slice());
        assert!(!RowKind::Normal.starts_slice() && !RowKind::Normal.ends_slice());
        assert!(RowKind::new(false, true).ends_slice());
    }

    #[test]
    fn wavefront_wait() {
        let slot = Arc::new(RowSlot::<u32>::new(RowKind::Normal, 0));
        let exit = ExitFlag::new();

        let waiter = {
            let slot = Arc::clone(&slot);
            let exit = exit.clone();
            thread::spawn(move || slot.wait_coded(3, &exit))
        };

        slot.set_coded(2);
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        // Progress never goes backward.
        slot.set_coded(1);
        assert_eq!(slot.coded(), 2);

        slot.finish(vec![1, 2], 4);
        waiter.join().unwrap().unwrap();
        assert_eq!(slot.take_bitstream(), Some(vec![1, 2]));
        assert_eq!(slot.take_bitstream(), None);
    }

    #[test]
    fn entropy_handover() {
        let slot = Arc::new(RowSlot::<u32>::new(RowKind::SliceStart, 0));
        let exit = ExitFlag::new();

        let taker = {
            let slot = Arc::clone(&slot);
            let exit = exit.clone();
            thread::spawn(move || slot.take_entropy(&exit))
        };

        slot.store_entropy(7);
        assert_eq!(taker.join().unwrap().unwrap(), 7);

        exit.raise();
        assert!(matches!(
            slot.take_entropy(&exit),
            Err(EncodeError::Cancelled)
        ));
    }

    #[test]
    fn row_contexts_are_bounded() {
        let pool = Arc::new(RowContextPool::new(1));
        let exit = ExitFlag::new();

        let first = pool.acquire(&exit).unwrap();
        assert_eq!(pool.num_free(), 0);

        let waiter = {
            let pool = Arc::clone(&pool);
            let exit = exit.clone();
            thread::spawn(move || {
                let guard = pool.acquire(&exit)?;
                Ok::<_, EncodeError>(guard.context.as_ref().map(|context| context.id))
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(waiter.join().unwrap().unwrap(), Some(0));
        assert_eq!(pool.num_free(), 1);
    }
}
