// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed set of frame slots shared by every picture of the stream, acting both as the input and
//! the decoded picture buffer.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use crate::config::FrameGeometry;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::frame::Frame;
use crate::frame::Recycle;
use crate::utils::wait_until;
use crate::utils::ExitFlag;

/// Counters kept under the pool lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of frames handed out
    pub acquired: u64,
    /// Number of frames recycled by the stale frame fallback
    pub stale_recycled: u64,
}

pub struct FramePool {
    frames: Vec<Arc<Frame>>,
    /// Serializes the free slot search. Signaled every time a frame becomes free.
    stats: Mutex<PoolStats>,
    cond: Condvar,
    stale_distance: i64,
    exit: ExitFlag,
}

impl FramePool {
    pub fn new(
        capacity: usize,
        geometry: FrameGeometry,
        stale_distance: i64,
        exit: ExitFlag,
    ) -> Self {
        log::debug!(
            "frame pool of {capacity} slots, {}x{} LCUs each",
            geometry.cols,
            geometry.rows
        );

        Self {
            frames: (0..capacity)
                .map(|slot| Arc::new(Frame::new(slot, geometry)))
                .collect(),
            stats: Mutex::new(Default::default()),
            cond: Condvar::new(),
            stale_distance,
            exit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Arc<Frame>] {
        &self.frames
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.lock().unwrap()
    }

    /// Blocks until a frame can hold the picture at `display_order` and returns it with
    /// [`crate::frame::ENCODE_HOLDS`] holds, plus the "referenced by others" hold if requested.
    ///
    /// Free frames are always preferred. If there is none, a stale frame is reclaimed: one that is
    /// idle, only kept alive by the GOP reference window and at least `stale_distance` pictures
    /// away. This prevents a template that never evicts from starving the pool, at the cost of
    /// dropping a reference the template still expected to exist.
    ///
    /// Fails with [`EncodeError::Cancelled`] if the exit flag is raised while
    /// waiting.
    pub fn acquire_free_frame(
        &self,
        display_order: i64,
        referenced_by_others: bool,
    ) -> EncodeResult<Arc<Frame>> {
        let mut acquired = None;

        let stats = self.stats.lock().unwrap();
        let mut stats = wait_until(stats, &self.cond, &self.exit, |_| {
            // Re-evaluated from scratch after every wake-up.
            acquired = self
                .scan(display_order, None, referenced_by_others)
                .or_else(|| {
                    self.scan(display_order, Some(self.stale_distance), referenced_by_others)
                });
            acquired.is_some()
        })?;

        // The predicate only returns true once a frame was claimed.
        let (frame, recycle) = acquired.ok_or(EncodeError::InvalidInternalState)?;
        stats.acquired += 1;
        if recycle == Recycle::Stale {
            stats.stale_recycled += 1;
            log::warn!(
                "no free frame for display order {display_order}, recycled stale slot {}",
                frame.slot()
            );
        }

        log::trace!(
            "acquired slot {} for display order {display_order}",
            frame.slot()
        );

        Ok(frame)
    }

    fn scan(
        &self,
        display_order: i64,
        stale_distance: Option<i64>,
        referenced_by_others: bool,
    ) -> Option<(Arc<Frame>, Recycle)> {
        self.frames.iter().find_map(|frame| {
            frame
                .try_recycle(display_order, stale_distance, referenced_by_others)
                .map(|recycle| (Arc::clone(frame), recycle))
        })
    }

    /// Wakes the acquirers. Called once per freed frame, by whichever of [`FramePool::release`],
    /// [`FramePool::apply_removals`] and [`FramePool::retire`] freed it. Must be called without
    /// holding any frame lock.
    fn notify_free(&self, frame: &Frame) {
        log::trace!("slot {} (coi={}) is free", frame.slot(), frame.coi());
        let _stats = self.stats.lock().unwrap();
        self.cond.notify_all();
    }

    /// Drops one hold on `frame`, waking the acquirers if it became free.
    pub fn release(&self, frame: &Frame) {
        if frame.drop_ref() {
            self.notify_free(frame);
        }
    }

    /// Drops the "referenced by others" hold of every frame of `removals`. Frames that already
    /// lost it are skipped, so a frame is never evicted twice.
    pub fn apply_removals(&self, removals: &[Arc<Frame>]) {
        for frame in removals {
            match frame.drop_reference_hold() {
                Some(freed) => {
                    log::debug!("evicted coi={} from the reference window", frame.coi());
                    if freed {
                        self.notify_free(frame);
                    }
                }
                None => log::trace!("coi={} already evicted", frame.coi()),
            }
        }
    }

    /// Unbinds `frame` from the frame context that encoded it.
    pub fn retire(&self, frame: &Frame) {
        if frame.retire() {
            self.notify_free(frame);
        }
    }

    /// Returns the live frame with coding order index `coi`, if any.
    pub fn find_by_coi(&self, coi: i64) -> Option<Arc<Frame>> {
        if coi < 0 {
            return None;
        }

        self.frames
            .iter()
            .find(|frame| frame.coi() == coi && frame.reference_count() > 0)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::frame::FrameIdentity;
    use crate::frame::ENCODE_HOLDS;
    use crate::Picture;
    use crate::Resolution;
    use crate::SliceType;

    fn pool(capacity: usize, stale_distance: i64, exit: ExitFlag) -> Arc<FramePool> {
        let geometry = FrameGeometry::new(Resolution::from((16, 16)), 16, 16);
        Arc::new(FramePool::new(capacity, geometry, stale_distance, exit))
    }

    fn assign(frame: &Frame, n: i64) {
        let picture = Picture::from_fn(Resolution::from((16, 16)), |_, _| 0);
        let id = FrameIdentity {
            display_order: n,
            coi: n,
            gop_idr_coi: 0,
        };
        frame.assign(id, SliceType::P, n == 0, 0, &picture);
    }

    /// Simulates the end of the encoding of `frame`.
    fn finish(pool: &FramePool, frame: &Frame) {
        for _ in 0..ENCODE_HOLDS {
            pool.release(frame);
        }
        pool.retire(frame);
    }

    #[test]
    fn acquire_prefers_free_frames() {
        let pool = pool(2, 1, ExitFlag::new());
        let a = pool.acquire_free_frame(0, true).unwrap();
        assign(&a, 0);
        finish(&pool, &a);

        // `a` is stale but a free slot exists.
        let b = pool.acquire_free_frame(10, false).unwrap();
        assert_ne!(a.slot(), b.slot());
        assert_eq!(b.reference_count(), ENCODE_HOLDS);
        assert_eq!(pool.stats().stale_recycled, 0);
    }

    #[test]
    fn find_by_coi_ignores_free_frames() {
        let pool = pool(2, 100, ExitFlag::new());
        let a = pool.acquire_free_frame(0, false).unwrap();
        assign(&a, 0);
        assert!(pool.find_by_coi(0).is_some());
        assert!(pool.find_by_coi(-1).is_none());

        finish(&pool, &a);
        assert!(pool.find_by_coi(0).is_none());
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let pool = pool(1, 100, ExitFlag::new());
        let a = pool.acquire_free_frame(0, true).unwrap();
        assign(&a, 0);
        finish(&pool, &a);

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_free_frame(1, false))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        pool.apply_removals(&[Arc::clone(&a)]);
        let b = waiter.join().unwrap().unwrap();
        assert_eq!(b.slot(), a.slot());
        assert_eq!(pool.stats().acquired, 2);
    }

    #[test]
    fn removals_are_applied_once() {
        let pool = pool(1, 100, ExitFlag::new());
        let a = pool.acquire_free_frame(0, true).unwrap();
        assign(&a, 0);
        a.add_ref();

        pool.apply_removals(&[Arc::clone(&a), Arc::clone(&a)]);
        assert_eq!(a.reference_count(), ENCODE_HOLDS + 1);
        assert!(!a.is_reference());
    }

    #[test]
    fn stale_fallback() {
        let pool = pool(2, 4, ExitFlag::new());
        for n in 0..2 {
            let frame = pool.acquire_free_frame(n, true).unwrap();
            assign(&frame, n);
            finish(&pool, &frame);
        }

        // Display order 5 is at least 4 pictures away from 0 and 1.
        let frame = pool.acquire_free_frame(5, true).unwrap();
        assert_eq!(frame.slot(), 0);
        assert_eq!(frame.reference_count(), ENCODE_HOLDS + 1);
        assert_eq!(pool.stats().stale_recycled, 1);
        assert!(pool.find_by_coi(0).is_none());
        assert!(pool.find_by_coi(1).is_some());
    }

    #[test]
    fn ten_p_frames_with_small_pool() {
        // Capacity 4, reference window of 2 pictures.
        let pool = pool(4, 1000, ExitFlag::new());
        let mut window: Vec<Arc<Frame>> = vec![];

        for n in 0..10 {
            let frame = pool.acquire_free_frame(n, true).unwrap();
            assign(&frame, n);
            if window.len() == 2 {
                pool.apply_removals(&[window.remove(0)]);
            }
            window.push(Arc::clone(&frame));
            finish(&pool, &frame);
        }

        assert_eq!(pool.stats().acquired, 10);
        assert_eq!(pool.stats().stale_recycled, 0);
    }

    #[test]
    fn cancelled_acquire() {
        let exit = ExitFlag::new();
        let pool = pool(1, 100, exit.clone());
        let _a = pool.acquire_free_frame(0, true).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_free_frame(1, false))
        };

        exit.raise();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(EncodeError::Cancelled)
        ));
    }
}
