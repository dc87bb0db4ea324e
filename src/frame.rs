// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::ops::Range;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;

use crate::config::FrameGeometry;
use crate::encoder::EncodeResult;
use crate::rps::Rps;
use crate::utils::wait_until;
use crate::utils::ExitFlag;
use crate::Picture;
use crate::SliceType;

/// Holds taken on a frame when it is handed out by the pool: one for the reconstruction (RDO)
/// path, one for the in-loop filter path and one for the entropy coding path.
pub const ENCODE_HOLDS: u32 = 3;

/// Identity of the picture currently stored in a frame slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameIdentity {
    /// Position in presentation order
    pub display_order: i64,
    /// Coding order index
    pub coi: i64,
    /// Coding order index of the IDR picture starting the GOP of this picture
    pub gop_idr_coi: i64,
}

impl FrameIdentity {
    /// Identity of a slot that never held a picture.
    const UNASSIGNED: Self = Self {
        display_order: i64::MIN,
        coi: -1,
        gop_idr_coi: -1,
    };
}

/// Outcome of [`Frame::try_recycle`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Recycle {
    /// The frame was not referenced anymore
    Free,
    /// The frame was still referenced, but idle and far enough in display order to be reclaimed
    Stale,
}

pub(crate) struct FrameState {
    id: FrameIdentity,
    reference_count: u32,
    slice_type: SliceType,
    is_keyframe: bool,
    temporal_id: u8,
    /// The "referenced by others" hold is still outstanding
    referenced_by_others: bool,
    /// Bound to a frame context that has not finished with it yet
    in_flight: bool,
    /// Per LCU row, number of columns reconstructed, filtered and border expanded
    lcu_done: Vec<u32>,
    rps: Option<Rps>,
}

/// A reusable picture slot of the frame pool.
///
/// The reference count and the row progress are guarded by the frame's own lock. The condition
/// variable is broadcast whenever a row is published, so motion search of later pictures can
/// wait on it.
pub struct Frame {
    slot: usize,
    geometry: FrameGeometry,
    state: Mutex<FrameState>,
    cond: Condvar,
    /// Source samples padded to the LCU grid
    input: RwLock<Vec<u8>>,
    /// Reconstructed samples, one buffer per LCU row
    recon: Vec<Mutex<Vec<u8>>>,
}

impl Frame {
    pub(crate) fn new(slot: usize, geometry: FrameGeometry) -> Self {
        let rows = geometry.rows;
        Self {
            slot,
            geometry,
            state: Mutex::new(FrameState {
                id: FrameIdentity::UNASSIGNED,
                reference_count: 0,
                slice_type: SliceType::I,
                is_keyframe: false,
                temporal_id: 0,
                referenced_by_others: false,
                in_flight: false,
                lcu_done: vec![0; rows],
                rps: None,
            }),
            cond: Condvar::new(),
            input: RwLock::new(vec![0; geometry.row_len() * rows]),
            recon: (0..rows)
                .map(|_| Mutex::new(vec![0; geometry.row_len()]))
                .collect(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    fn state(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock().unwrap()
    }

    pub fn identity(&self) -> FrameIdentity {
        self.state().id
    }

    pub fn coi(&self) -> i64 {
        self.state().id.coi
    }

    pub fn display_order(&self) -> i64 {
        self.state().id.display_order
    }

    pub fn reference_count(&self) -> u32 {
        self.state().reference_count
    }

    pub fn slice_type(&self) -> SliceType {
        self.state().slice_type
    }

    pub fn is_keyframe(&self) -> bool {
        self.state().is_keyframe
    }

    pub fn temporal_id(&self) -> u8 {
        self.state().temporal_id
    }

    /// Whether the frame is still a reference picture, ie. its "referenced by others" hold has
    /// not been removed yet.
    pub fn is_reference(&self) -> bool {
        let state = self.state();
        state.referenced_by_others && state.reference_count > 0
    }

    pub fn is_in_flight(&self) -> bool {
        self.state().in_flight
    }

    /// The reference picture set the frame was encoded with.
    pub fn rps(&self) -> Option<Rps> {
        self.state().rps.clone()
    }

    /// Claims the slot for a new picture if it is free or, when `stale_distance` is given, stale:
    /// idle, only held as a reference by the GOP structure (no picture in flight reads it) and at
    /// least `stale_distance` away from `display_order`. On success the reference count is reset to
    /// [`ENCODE_HOLDS`], plus one if the new picture is `referenced_by_others`.
    pub(crate) fn try_recycle(
        &self,
        display_order: i64,
        stale_distance: Option<i64>,
        referenced_by_others: bool,
    ) -> Option<Recycle> {
        let mut state = self.state();
        if state.in_flight {
            return None;
        }

        let recycle = match stale_distance {
            _ if state.reference_count == 0 => Recycle::Free,
            Some(distance)
                if state.referenced_by_others
                    && state.reference_count == 1
                    && display_order.abs_diff(state.id.display_order) >= distance as u64 =>
            {
                Recycle::Stale
            }
            _ => return None,
        };

        state.id = FrameIdentity::UNASSIGNED;
        state.reference_count = ENCODE_HOLDS + u32::from(referenced_by_others);
        state.referenced_by_others = referenced_by_others;
        state.in_flight = true;
        state.lcu_done.iter_mut().for_each(|done| *done = 0);
        state.rps = None;

        Some(recycle)
    }

    /// Gives the claimed slot the identity of the picture it now holds and copies the source
    /// samples in.
    pub(crate) fn assign(
        &self,
        id: FrameIdentity,
        slice_type: SliceType,
        is_keyframe: bool,
        temporal_id: u8,
        picture: &Picture,
    ) {
        self.load_input(picture);

        let mut state = self.state();
        state.id = id;
        state.slice_type = slice_type;
        state.is_keyframe = is_keyframe;
        state.temporal_id = temporal_id;
    }

    pub(crate) fn set_rps(&self, rps: Rps) {
        self.state().rps = Some(rps);
    }

    /// Takes one more hold on the frame.
    pub(crate) fn add_ref(&self) {
        let mut state = self.state();
        state.reference_count += 1;
        log::trace!(
            "frame coi={} slot={} reference_count={}",
            state.id.coi,
            self.slot,
            state.reference_count
        );
    }

    /// Drops one hold. Returns true if this call made the frame free, ie. released the last hold
    /// of a frame no longer bound to a frame context.
    pub(crate) fn drop_ref(&self) -> bool {
        let mut state = self.state();
        match state.reference_count {
            0 => {
                log::error!(
                    "reference count underflow on frame coi={} slot={}",
                    state.id.coi,
                    self.slot
                );
                false
            }
            n => {
                state.reference_count = n - 1;
                n == 1 && !state.in_flight
            }
        }
    }

    /// Drops the "referenced by others" hold if it is still outstanding. Returns `None` if it was
    /// already dropped, otherwise whether the frame became free.
    pub(crate) fn drop_reference_hold(&self) -> Option<bool> {
        let mut state = self.state();
        if !state.referenced_by_others || state.reference_count == 0 {
            return None;
        }

        state.referenced_by_others = false;
        state.reference_count -= 1;
        Some(state.reference_count == 0 && !state.in_flight)
    }

    /// Marks the frame as no longer bound to a frame context. Returns true if this call made the
    /// frame free.
    ///
    /// The hold count and the in-flight flag change under the same lock, so exactly one of
    /// [`Frame::drop_ref`], [`Frame::drop_reference_hold`] and this method reports a given frame
    /// as freed.
    pub(crate) fn retire(&self) -> bool {
        let mut state = self.state();
        let was_in_flight = std::mem::replace(&mut state.in_flight, false);
        was_in_flight && state.reference_count == 0
    }

    pub fn lcu_done(&self, row: usize) -> u32 {
        self.state().lcu_done[row]
    }

    /// Publishes row `row` as reconstructed up to `cols` columns and wakes every waiter. The
    /// progress of a row never decreases.
    pub(crate) fn publish_row(&self, row: usize, cols: u32) {
        let mut state = self.state();
        let done = &mut state.lcu_done[row];
        *done = (*done).max(cols);
        drop(state);

        self.cond.notify_all();
    }

    /// Blocks until every row of `rows` is fully published.
    pub(crate) fn wait_rows(&self, rows: Range<usize>, exit: &ExitFlag) -> EncodeResult<()> {
        let cols = self.geometry.cols as u32;
        let _state = wait_until(self.state(), &self.cond, exit, |state| {
            state.lcu_done[rows.clone()].iter().all(|&done| done >= cols)
        })?;

        Ok(())
    }

    fn load_input(&self, picture: &Picture) {
        let width = picture.resolution.width as usize;
        let height = picture.resolution.height as usize;
        let stride = self.geometry.padded_width();
        let mut plane = self.input.write().unwrap();
        let padded_height = plane.len() / stride;

        // Copy the visible area and replicate the right and bottom edges into the padding.
        for y in 0..padded_height {
            let src_y = y.min(height - 1);
            let src = &picture.luma[src_y * width..(src_y + 1) * width];
            let dst = &mut plane[y * stride..(y + 1) * stride];
            dst[..width].copy_from_slice(src);
            dst[width..].fill(src[width - 1]);
        }
    }

    /// Source samples, `geometry().padded_width()` per line.
    pub fn input(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.input.read().unwrap()
    }

    /// Reconstructed samples of one LCU row, `geometry().padded_width()` per line.
    pub fn recon_row(&self, row: usize) -> MutexGuard<'_, Vec<u8>> {
        self.recon[row].lock().unwrap()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Frame")
            .field("slot", &self.slot)
            .field("id", &state.id)
            .field("slice_type", &state.slice_type)
            .field("reference_count", &state.reference_count)
            .field("referenced_by_others", &state.referenced_by_others)
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::encoder::EncodeError;
    use crate::Resolution;

    fn geometry() -> FrameGeometry {
        FrameGeometry::new(Resolution::from((40, 40)), 16, 16)
    }

    fn identity(n: i64) -> FrameIdentity {
        FrameIdentity {
            display_order: n,
            coi: n,
            gop_idr_coi: 0,
        }
    }

    #[test]
    fn recycle_sets_holds() {
        let frame = Frame::new(0, geometry());
        assert_eq!(frame.try_recycle(0, None, true), Some(Recycle::Free));
        assert_eq!(frame.reference_count(), ENCODE_HOLDS + 1);
        assert!(frame.is_reference());
        assert!(frame.is_in_flight());

        // A bound frame is never handed out again.
        assert_eq!(frame.try_recycle(1000, Some(100), false), None);

        let frame = Frame::new(1, geometry());
        assert_eq!(frame.try_recycle(0, None, false), Some(Recycle::Free));
        assert_eq!(frame.reference_count(), ENCODE_HOLDS);
        assert!(!frame.is_reference());
    }

    #[test]
    fn holds_release_to_zero() {
        let frame = Frame::new(0, geometry());
        frame.try_recycle(0, None, true).unwrap();
        frame.add_ref();

        for _ in 0..ENCODE_HOLDS {
            assert!(!frame.drop_ref());
        }
        assert_eq!(frame.drop_reference_hold(), Some(false));
        // The hold can only be removed once.
        assert_eq!(frame.drop_reference_hold(), None);
        // Still bound to a frame context.
        assert!(!frame.drop_ref());
        assert_eq!(frame.reference_count(), 0);
        assert!(frame.retire());
        // Retiring twice does not free it again.
        assert!(!frame.retire());
        assert_eq!(frame.reference_count(), 0);

        // Underflow is refused.
        assert!(!frame.drop_ref());
        assert_eq!(frame.reference_count(), 0);
    }

    #[test]
    fn freed_by_last_of_retire_and_release() {
        // Retired before the last hold is dropped.
        let frame = Frame::new(0, geometry());
        frame.try_recycle(0, None, false).unwrap();
        for _ in 0..ENCODE_HOLDS - 1 {
            assert!(!frame.drop_ref());
        }
        assert!(!frame.retire());
        assert!(frame.drop_ref());
        assert!(!frame.retire());

        // Reference hold dropped last, after retiring.
        let frame = Frame::new(1, geometry());
        frame.try_recycle(0, None, true).unwrap();
        for _ in 0..ENCODE_HOLDS {
            assert!(!frame.drop_ref());
        }
        assert!(!frame.retire());
        assert_eq!(frame.drop_reference_hold(), Some(true));
    }

    #[test]
    fn stale_recycling() {
        let picture = Picture::from_fn(Resolution::from((40, 40)), |_, _| 0);
        let frame = Frame::new(0, geometry());
        frame.try_recycle(0, None, true).unwrap();
        frame.assign(identity(3), SliceType::P, false, 0, &picture);

        // Still bound to a frame context.
        assert_eq!(frame.try_recycle(500, Some(100), false), None);
        assert!(!frame.retire());

        // Idle, but its encode holds are still outstanding.
        assert_eq!(frame.try_recycle(500, Some(100), false), None);
        for _ in 0..ENCODE_HOLDS {
            frame.drop_ref();
        }

        // Idle but referenced and close in display order.
        assert_eq!(frame.try_recycle(50, Some(100), false), None);
        assert_eq!(frame.try_recycle(103, Some(100), false), Some(Recycle::Stale));
        assert_eq!(frame.reference_count(), ENCODE_HOLDS);
        assert_eq!(frame.coi(), -1);
    }

    #[test]
    fn input_is_padded() {
        let picture = Picture::from_fn(Resolution::from((40, 40)), |x, y| (x + y) as u8);
        let frame = Frame::new(0, geometry());
        frame.try_recycle(0, None, false).unwrap();
        frame.assign(identity(0), SliceType::I, true, 0, &picture);

        let stride = frame.geometry().padded_width();
        assert_eq!(stride, 48);
        let input = frame.input();
        assert_eq!(input[5 * stride + 7], 12);
        // Right padding repeats the last column, bottom padding the last line.
        assert_eq!(input[5 * stride + 47], 44);
        assert_eq!(input[47 * stride + 3], 42);
    }

    #[test]
    fn publish_is_monotonic() {
        let frame = Frame::new(0, geometry());
        frame.publish_row(1, 3);
        frame.publish_row(1, 2);
        assert_eq!(frame.lcu_done(1), 3);
    }

    #[test]
    fn wait_rows_blocks_until_published() {
        let frame = Arc::new(Frame::new(0, geometry()));
        let exit = ExitFlag::new();

        let waiter = {
            let frame = Arc::clone(&frame);
            let exit = exit.clone();
            thread::spawn(move || frame.wait_rows(0..2, &exit))
        };

        frame.publish_row(0, 3);
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        frame.publish_row(1, 3);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn wait_rows_cancelled() {
        let frame = Frame::new(0, geometry());
        let exit = ExitFlag::new();
        exit.raise();
        assert!(matches!(
            frame.wait_rows(0..1, &exit),
            Err(EncodeError::Cancelled)
        ));
    }
}
