// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame-level scheduling.
//!
//! The [`FrameScheduler`] owns N frame contexts. Binding a picture to a context acquires its
//! frame slot, builds its reference picture set and queues three kinds of jobs:
//!
//! * one job per LCU row on the row workers (see [`row`]);
//! * a frame job on the frame workers, releasing the reference holds once the rows are coded and
//!   the frame's own holds once they are filtered;
//! * an entropy job (AEC) serializing the picture and handing it to the
//!   [`output::OutputSequencer`], either on the dedicated entropy worker or inline at the end of
//!   the frame job.
//!
//! Jobs are queued by the submitting thread in coding order. As every worker pool runs its jobs
//! in FIFO order, any job a running job waits on was dequeued before it and cannot be starved.
//!
//! A context goes back to [`FrameTaskState::Free`] once both the reconstruction and the entropy
//! paths are done, whichever finishes last.

pub mod output;
pub mod row;

use std::ops::Range;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use bytes::Bytes;
use crossbeam_channel::Receiver;

use crate::backend::EncoderBackend;
use crate::backend::FrameInfo;
use crate::config::EncoderConfig;
use crate::config::FrameGeometry;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncodedPacket;
use crate::encoder::EncoderOutput;
use crate::frame::Frame;
use crate::frame::FrameIdentity;
use crate::frame::ENCODE_HOLDS;
use crate::frame_pool::FramePool;
use crate::lookahead::LookaheadEntry;
use crate::rps::template::GopTemplate;
use crate::rps::RpsBuilder;
use crate::scheduler::output::OutputSequencer;
use crate::scheduler::row::RowContextPool;
use crate::scheduler::row::RowKind;
use crate::scheduler::row::RowSlot;
use crate::utils::wait_until;
use crate::utils::ExitFlag;
use crate::utils::WorkerPool;

/// State of a frame context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameTaskState {
    Free,
    Busy,
    /// Reconstruction and filtering done, entropy coding pending
    RdoDone,
    /// Entropy coding done, reconstruction pending
    AecDone,
}

/// One of the two paths a frame context waits for before being freed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stage {
    Rdo,
    Aec,
}

#[derive(Debug)]
struct FrameContext {
    state: FrameTaskState,
    /// Picture bound to the context, -1 when free
    coi: i64,
    frames_encoded: u64,
}

/// The N frame contexts.
pub(crate) struct FrameContexts {
    contexts: Mutex<Vec<FrameContext>>,
    /// Broadcast every time a context is freed
    cond: Condvar,
}

impl FrameContexts {
    fn new(count: usize) -> Self {
        Self {
            contexts: Mutex::new(
                (0..count)
                    .map(|_| FrameContext {
                        state: FrameTaskState::Free,
                        coi: -1,
                        frames_encoded: 0,
                    })
                    .collect(),
            ),
            cond: Condvar::new(),
        }
    }

    /// Waits for a free context and marks it busy with picture `coi`.
    fn acquire(&self, coi: i64, exit: &ExitFlag) -> EncodeResult<usize> {
        let contexts = self.contexts.lock().unwrap();
        let mut contexts = wait_until(contexts, &self.cond, exit, |contexts| {
            contexts.iter().any(|c| c.state == FrameTaskState::Free)
        })?;

        let index = contexts
            .iter()
            .position(|c| c.state == FrameTaskState::Free)
            .ok_or(EncodeError::InvalidInternalState)?;

        let context = &mut contexts[index];
        context.state = FrameTaskState::Busy;
        context.coi = coi;
        log::trace!("frame context {index} bound to coi={coi}");

        Ok(index)
    }

    fn set_free(&self, index: usize) {
        let mut contexts = self.contexts.lock().unwrap();
        contexts[index].state = FrameTaskState::Free;
        contexts[index].coi = -1;
        drop(contexts);

        self.cond.notify_all();
    }

    /// Records the completion of `stage`. Returns true if the context became free.
    fn finish(&self, index: usize, stage: Stage) -> EncodeResult<bool> {
        let mut contexts = self.contexts.lock().unwrap();
        let context = &mut contexts[index];

        context.state = match (context.state, stage) {
            (FrameTaskState::Busy, Stage::Rdo) => FrameTaskState::RdoDone,
            (FrameTaskState::Busy, Stage::Aec) => FrameTaskState::AecDone,
            (FrameTaskState::AecDone, Stage::Rdo) | (FrameTaskState::RdoDone, Stage::Aec) => {
                FrameTaskState::Free
            }
            (state, stage) => {
                log::error!("frame context {index} finished {stage:?} in state {state:?}");
                return Err(EncodeError::InvalidInternalState);
            }
        };

        if context.state != FrameTaskState::Free {
            return Ok(false);
        }

        context.frames_encoded += 1;
        log::trace!(
            "frame context {index} done with coi={}, {} frames encoded",
            context.coi,
            context.frames_encoded
        );
        context.coi = -1;
        drop(contexts);

        self.cond.notify_all();
        Ok(true)
    }

    /// Blocks until no context is bound to a picture.
    fn wait_all_idle(&self, exit: &ExitFlag) -> EncodeResult<()> {
        let contexts = self.contexts.lock().unwrap();
        let _contexts = wait_until(contexts, &self.cond, exit, |contexts| {
            contexts.iter().all(|c| c.state == FrameTaskState::Free)
        })?;

        Ok(())
    }

    fn states(&self) -> Vec<FrameTaskState> {
        self.contexts
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.state)
            .collect()
    }
}

/// State shared by the scheduler and every job it queues.
pub(crate) struct Shared<B: EncoderBackend> {
    pub(crate) backend: B,
    pub(crate) pool: FramePool,
    pub(crate) exit: ExitFlag,
    pub(crate) row_contexts: RowContextPool,
    frame_contexts: FrameContexts,
    output: OutputSequencer,
    inline_aec: bool,
    /// First error hit by a job
    failure: Mutex<Option<String>>,
}

impl<B: EncoderBackend> Shared<B> {
    /// Records the failure of a job and stops the pipeline.
    pub(crate) fn fail(&self, err: EncodeError) {
        if let EncodeError::Cancelled = err {
            log::trace!("job cancelled");
            return;
        }

        log::error!("encoding job failed: {err}");
        self.failure.lock().unwrap().get_or_insert(err.to_string());
        self.exit.raise();
    }

    fn finish_stage(&self, job: &FrameJob<B::EntropyState>, stage: Stage) -> EncodeResult<()> {
        if self.frame_contexts.finish(job.context, stage)? {
            self.pool.retire(&job.frame);
        }

        Ok(())
    }
}

struct FrameProgress {
    rows_coded: usize,
    rows_filtered: usize,
    /// A thread is running the in-loop filter of the frame
    filter_busy: bool,
    /// Sealed slices, in slice order
    slices: Vec<Option<Vec<u8>>>,
}

/// A picture bound to a frame context.
pub(crate) struct FrameJob<S> {
    pub(crate) context: usize,
    /// Position of the picture in the output
    pub(crate) turn: u64,
    pub(crate) info: FrameInfo,
    pub(crate) frame: Arc<Frame>,
    /// References, each one with a hold released once the rows are coded
    pub(crate) refs: Vec<Arc<Frame>>,
    pub(crate) rows: Vec<RowSlot<S>>,
    pts: i64,
    dts: i64,
    ref_display_orders: Vec<i64>,
    progress: Mutex<FrameProgress>,
    cond: Condvar,
}

impl<S> FrameJob<S> {
    fn new_rows(geometry: &FrameGeometry, slices: &[Range<usize>]) -> Vec<RowSlot<S>> {
        let mut rows = Vec::with_capacity(geometry.rows);
        for (index, slice) in slices.iter().enumerate() {
            for row in slice.clone() {
                let kind = RowKind::new(row == slice.start, row + 1 == slice.end);
                rows.push(RowSlot::new(kind, index));
            }
        }

        rows
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Records that one more row is fully coded.
    pub(crate) fn row_coded(&self) {
        self.progress.lock().unwrap().rows_coded += 1;
        self.cond.notify_all();
    }

    /// Concatenates the bits of the rows of slice `slice`, whose last row is `last_row`.
    pub(crate) fn seal_slice(&self, slice: usize, last_row: usize) -> EncodeResult<()> {
        let mut bitstream = vec![];
        let first_row = (0..=last_row)
            .rev()
            .take_while(|&row| self.rows[row].slice == slice)
            .last()
            .ok_or(EncodeError::InvalidInternalState)?;

        for row in first_row..=last_row {
            let bits = self.rows[row]
                .take_bitstream()
                .ok_or(EncodeError::InvalidInternalState)?;
            bitstream.extend_from_slice(&bits);
        }

        log::trace!(
            "coi={} slice {slice} sealed, rows {first_row}..={last_row}, {} bytes",
            self.info.coi,
            bitstream.len()
        );

        self.progress.lock().unwrap().slices[slice] = Some(bitstream);
        Ok(())
    }

    fn wait_coded(&self, exit: &ExitFlag) -> EncodeResult<()> {
        let rows = self.num_rows();
        let progress = self.progress.lock().unwrap();
        let _progress = wait_until(progress, &self.cond, exit, |p| p.rows_coded == rows)?;
        Ok(())
    }

    fn wait_filtered(&self, exit: &ExitFlag) -> EncodeResult<()> {
        let rows = self.num_rows();
        let progress = self.progress.lock().unwrap();
        let _progress = wait_until(progress, &self.cond, exit, |p| p.rows_filtered == rows)?;
        Ok(())
    }

    fn take_slices(&self) -> EncodeResult<Vec<Vec<u8>>> {
        let mut progress = self.progress.lock().unwrap();
        progress
            .slices
            .iter_mut()
            .map(|slice| slice.take().ok_or(EncodeError::InvalidInternalState))
            .collect()
    }

    /// Whether row `row` can be filtered: it is coded, and so is the row below it if any.
    fn can_filter(&self, row: usize) -> bool {
        let cols = self.frame.geometry().cols;
        let rows = self.num_rows();
        row < rows
            && self.rows[row].coded() == cols
            && (row + 1 == rows || self.rows[row + 1].coded() == cols)
    }

    /// Filters, pads and publishes the rows that became ready, strictly in row order. Only one
    /// thread filters a given frame at a time; the others leave their rows to it.
    pub(crate) fn filter_ready_rows<B>(&self, backend: &B) -> EncodeResult<()>
    where
        B: EncoderBackend<EntropyState = S>,
    {
        let cols = self.frame.geometry().cols;

        loop {
            let row = {
                let mut progress = self.progress.lock().unwrap();
                let row = progress.rows_filtered;
                if progress.filter_busy || !self.can_filter(row) {
                    return Ok(());
                }

                progress.filter_busy = true;
                row
            };

            backend.apply_in_loop_filters(&self.frame, row)?;
            backend.expand_border(&self.frame, row)?;
            self.frame.publish_row(row, cols as u32);

            let mut progress = self.progress.lock().unwrap();
            progress.filter_busy = false;
            progress.rows_filtered += 1;
            drop(progress);

            self.cond.notify_all();
        }
    }
}

/// Reconstruction path of a frame job.
fn run_frame<B: EncoderBackend>(
    shared: &Shared<B>,
    job: &FrameJob<B::EntropyState>,
) -> EncodeResult<()> {
    job.wait_coded(&shared.exit)?;

    // Nothing reads the references anymore.
    for reference in &job.refs {
        shared.pool.release(reference);
    }
    shared.pool.release(&job.frame);

    if shared.inline_aec {
        run_aec(shared, job)?;
    }

    job.wait_filtered(&shared.exit)?;
    shared.pool.release(&job.frame);

    shared.finish_stage(job, Stage::Rdo)
}

/// Entropy path of a frame job: serializes the sealed slices and emits the packet in turn.
fn run_aec<B: EncoderBackend>(
    shared: &Shared<B>,
    job: &FrameJob<B::EntropyState>,
) -> EncodeResult<()> {
    job.wait_coded(&shared.exit)?;

    let slices = job.take_slices()?;
    let mut data = vec![];
    let len = shared
        .backend
        .serialize_nal_units(&job.info, &slices, &mut data)?;
    log::trace!("coi={} serialized, {len} bytes", job.info.coi);

    let packet = EncodedPacket {
        data: Bytes::from(data),
        pts: job.pts,
        dts: job.dts,
        slice_type: job.info.slice_type,
        is_keyframe: job.info.is_keyframe,
        coi: job.info.coi,
        display_order: job.info.display_order,
        temporal_id: job.info.temporal_id,
        ref_display_orders: job.ref_display_orders.clone(),
    };

    shared.output.deliver(job.turn, packet, &shared.exit)?;
    shared.pool.release(&job.frame);

    shared.finish_stage(job, Stage::Aec)
}

pub struct FrameScheduler<B: EncoderBackend> {
    shared: Arc<Shared<B>>,
    gop: GopTemplate,
    geometry: FrameGeometry,
    slices: Vec<Range<usize>>,
    max_ref: usize,
    open_gop: bool,
    next_turn: u64,
    frame_workers: WorkerPool,
    row_workers: WorkerPool,
    aec_worker: Option<WorkerPool>,
}

impl<B: EncoderBackend> FrameScheduler<B> {
    pub fn new(
        config: &EncoderConfig,
        backend: B,
        exit: ExitFlag,
    ) -> EncodeResult<(Self, Receiver<EncoderOutput>)> {
        config.validate()?;

        let geometry = config.geometry();
        let (output, receiver) = OutputSequencer::new();

        let shared = Arc::new(Shared {
            backend,
            pool: FramePool::new(
                config.pool_capacity(),
                geometry,
                config.stale_frame_distance,
                exit.clone(),
            ),
            exit: exit.clone(),
            row_contexts: RowContextPool::new(config.row_threads),
            frame_contexts: FrameContexts::new(config.frame_threads),
            output,
            inline_aec: !config.aec_thread,
            failure: Mutex::new(None),
        });

        let aec_worker = match config.aec_thread {
            true => Some(WorkerPool::new("aec", 1, exit.clone())?),
            false => None,
        };

        log::debug!(
            "scheduler: {} frame contexts, {} row contexts, {} LCU rows of {} columns",
            config.frame_threads,
            config.row_threads,
            geometry.rows,
            geometry.cols
        );

        let scheduler = Self {
            shared,
            gop: GopTemplate::new(config),
            geometry,
            slices: geometry.slice_rows(config.num_slices),
            max_ref: config.max_ref,
            open_gop: config.open_gop,
            next_turn: 0,
            frame_workers: WorkerPool::new("frame", config.frame_threads, exit.clone())?,
            row_workers: WorkerPool::new("row", config.row_threads, exit)?,
            aec_worker,
        };

        Ok((scheduler, receiver))
    }

    pub fn pool(&self) -> &FramePool {
        &self.shared.pool
    }

    pub fn frame_task_states(&self) -> Vec<FrameTaskState> {
        self.shared.frame_contexts.states()
    }

    /// First error hit by a job, if any.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().unwrap().clone()
    }

    /// Binds `entry` to a free frame context, waiting for one if needed, and queues its jobs.
    ///
    /// Fails if the reference picture set of the picture cannot be built, in which case the
    /// context and the frame slot are released.
    pub fn allocate_frame_task(&mut self, entry: LookaheadEntry) -> EncodeResult<()> {
        let context = self
            .shared
            .frame_contexts
            .acquire(entry.coi, &self.shared.exit)?;

        match self.bind(context, entry) {
            Ok(job) => self.dispatch(job),
            Err(err) => {
                self.shared.frame_contexts.set_free(context);
                Err(err)
            }
        }
    }

    fn bind(
        &mut self,
        context: usize,
        entry: LookaheadEntry,
    ) -> EncodeResult<Arc<FrameJob<B::EntropyState>>> {
        let shared = &self.shared;
        let template = self
            .gop
            .get(entry.prev_subgop_size, entry.subgop_size, entry.subgop_pos)
            .ok_or(EncodeError::InvalidInternalState)?
            .clone();

        let frame = shared
            .pool
            .acquire_free_frame(entry.display_order, template.referenced_by_others)?;

        let id = FrameIdentity {
            display_order: entry.display_order,
            coi: entry.coi,
            gop_idr_coi: entry.gop_idr_coi,
        };
        frame.assign(
            id,
            entry.slice_type,
            entry.is_keyframe,
            template.temporal_id,
            &entry.picture,
        );

        let builder = RpsBuilder::new(&shared.pool, self.max_ref, self.open_gop);
        let list = match builder.build(&frame, &template, entry.subgop_pos) {
            Ok(list) => list,
            Err(err) => {
                self.discard(&frame);
                return Err(err);
            }
        };

        let (qp, lambda) = shared
            .backend
            .compute_qp_and_lambda(entry.slice_type, list.rps.qp_offset);

        // Evictions are applied before the next picture builds its reference picture set.
        shared.pool.apply_removals(&list.removals);

        let turn = self.next_turn;
        self.next_turn += 1;

        log::debug!(
            "coi={} display={} {:?} bound to context {context}, slot {}, qp={qp}, turn {turn}",
            entry.coi,
            entry.display_order,
            entry.slice_type,
            frame.slot()
        );

        let info = FrameInfo {
            coi: entry.coi,
            display_order: entry.display_order,
            slice_type: entry.slice_type,
            is_keyframe: entry.is_keyframe,
            temporal_id: list.rps.temporal_id,
            qp,
            lambda,
        };

        Ok(Arc::new(FrameJob {
            context,
            turn,
            info,
            ref_display_orders: list.refs.iter().map(|r| r.display_order()).collect(),
            refs: list.refs,
            rows: FrameJob::new_rows(&self.geometry, &self.slices),
            pts: entry.pts,
            dts: entry.dts,
            progress: Mutex::new(FrameProgress {
                rows_coded: 0,
                rows_filtered: 0,
                filter_busy: false,
                slices: vec![None; self.slices.len()],
            }),
            cond: Condvar::new(),
            frame,
        }))
    }

    /// Gives back every hold taken on a frame that will not be encoded.
    fn discard(&self, frame: &Arc<Frame>) {
        let pool = &self.shared.pool;
        for _ in 0..ENCODE_HOLDS {
            pool.release(frame);
        }
        pool.apply_removals(std::slice::from_ref(frame));
        pool.retire(frame);
    }

    fn dispatch(&self, job: Arc<FrameJob<B::EntropyState>>) -> EncodeResult<()> {
        for row in 0..job.num_rows() {
            let shared = Arc::clone(&self.shared);
            let job = Arc::clone(&job);
            self.row_workers.execute(move || {
                if let Err(err) = row::encode_row(&shared, &job, row) {
                    shared.fail(err);
                }
            })?;
        }

        if let Some(aec_worker) = &self.aec_worker {
            let shared = Arc::clone(&self.shared);
            let job = Arc::clone(&job);
            aec_worker.execute(move || {
                if let Err(err) = run_aec(&shared, &job) {
                    shared.fail(err);
                }
            })?;
        }

        let shared = Arc::clone(&self.shared);
        self.frame_workers.execute(move || {
            if let Err(err) = run_frame(&shared, &job) {
                shared.fail(err);
            }
        })
    }

    /// Blocks until every frame context is free, then emits the end of stream marker.
    pub fn finish(&self) -> EncodeResult<()> {
        self.shared.frame_contexts.wait_all_idle(&self.shared.exit)?;
        self.shared.output.finish()
    }

    /// Number of packets handed to the output so far.
    pub fn emitted(&self) -> u64 {
        self.shared.output.emitted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::lookahead::Lookahead;
    use crate::rps::template::RpsTemplate;
    use crate::Picture;
    use crate::Resolution;

    #[test]
    fn context_freed_by_last_stage() {
        let exit = ExitFlag::new();
        let contexts = FrameContexts::new(2);

        let a = contexts.acquire(0, &exit).unwrap();
        let b = contexts.acquire(1, &exit).unwrap();
        assert_ne!(a, b);

        assert!(!contexts.finish(a, Stage::Rdo).unwrap());
        assert!(!contexts.finish(b, Stage::Aec).unwrap());
        assert_eq!(
            contexts.states(),
            vec![FrameTaskState::RdoDone, FrameTaskState::AecDone]
        );

        assert!(contexts.finish(a, Stage::Aec).unwrap());
        assert!(contexts.finish(b, Stage::Rdo).unwrap());
        contexts.wait_all_idle(&exit).unwrap();

        // A free context cannot finish anything.
        assert!(matches!(
            contexts.finish(a, Stage::Rdo),
            Err(EncodeError::InvalidInternalState)
        ));
    }

    #[test]
    fn acquire_waits_for_free_context() {
        let exit = ExitFlag::new();
        let contexts = Arc::new(FrameContexts::new(1));
        let a = contexts.acquire(0, &exit).unwrap();

        let waiter = {
            let contexts = Arc::clone(&contexts);
            let exit = exit.clone();
            std::thread::spawn(move || contexts.acquire(1, &exit))
        };

        contexts.finish(a, Stage::Aec).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(!waiter.is_finished());

        contexts.finish(a, Stage::Rdo).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), a);
    }

    fn config() -> EncoderConfig {
        EncoderConfig {
            resolution: Resolution::from((64, 48)),
            lcu_size: 16,
            search_range: 16,
            num_bframes: 0,
            frame_threads: 2,
            row_threads: 2,
            ..Default::default()
        }
    }

    #[test]
    fn unavailable_reference_fails_allocation() {
        let config = EncoderConfig {
            gop_template: Some(vec![RpsTemplate {
                ref_pic: vec![5],
                rm_pic: vec![1],
                referenced_by_others: true,
                ..Default::default()
            }]),
            ..config()
        };

        let exit = ExitFlag::new();
        let (mut scheduler, receiver) =
            FrameScheduler::new(&config, DummyBackend::new(30), exit).unwrap();
        let mut lookahead = Lookahead::new(&config);

        let picture = Picture::from_fn(config.resolution, |x, y| (x ^ y) as u8);
        for entry in lookahead.push(picture.clone(), 0, 0) {
            scheduler.allocate_frame_task(entry).unwrap();
        }

        let mut entries = lookahead.push(picture, 1, 1);
        let res = scheduler.allocate_frame_task(entries.remove(0));
        assert!(matches!(
            res,
            Err(EncodeError::ReferenceUnavailable { coi: 1 })
        ));

        // The failed allocation gave everything back.
        scheduler.finish().unwrap();
        assert!(scheduler
            .frame_task_states()
            .iter()
            .all(|s| *s == FrameTaskState::Free));
        assert_eq!(receiver.try_iter().count(), 2);
        assert!(scheduler.pool().frames().iter().all(|f| !f.is_in_flight()));
    }

    #[test]
    fn packets_follow_coding_order() {
        let config = EncoderConfig {
            num_bframes: 3,
            aec_thread: false,
            ..config()
        };

        let exit = ExitFlag::new();
        let (mut scheduler, receiver) =
            FrameScheduler::new(&config, DummyBackend::new(30), exit).unwrap();
        let mut lookahead = Lookahead::new(&config);

        for n in 0..9 {
            let picture = Picture::from_fn(config.resolution, |x, y| (x + y + n as u32) as u8);
            for entry in lookahead.push(picture, n, n) {
                scheduler.allocate_frame_task(entry).unwrap();
            }
        }
        scheduler.finish().unwrap();

        let cois: Vec<_> = receiver
            .try_iter()
            .filter_map(|output| match output {
                EncoderOutput::Packet(packet) => Some(packet.coi),
                EncoderOutput::EndOfStream => None,
            })
            .collect();
        assert_eq!(cois, (0..9).collect::<Vec<_>>());
        assert_eq!(scheduler.emitted(), 9);
        assert!(scheduler.failure().is_none());
    }
}
