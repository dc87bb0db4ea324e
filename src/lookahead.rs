// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decision of the picture types and reordering from presentation order to coding order.

use std::collections::VecDeque;

use crate::config::EncoderConfig;
use crate::rps::template::reorder_depth;
use crate::rps::template::SUBGOP_ORDER;
use crate::Picture;
use crate::SliceType;

/// A picture released by the [`Lookahead`] in coding order.
#[derive(Debug)]
pub struct LookaheadEntry {
    pub picture: Picture,
    pub display_order: i64,
    pub pts: i64,
    pub dts: i64,
    pub slice_type: SliceType,
    /// IDR picture: starts a closed GOP and evicts every older reference
    pub is_keyframe: bool,
    /// Coding order index
    pub coi: i64,
    /// Coding order index of the random access point the picture belongs to
    pub gop_idr_coi: i64,
    /// Size of the sub-GOP the picture was released with
    pub subgop_size: usize,
    /// Size of the sub-GOP released before that one
    pub prev_subgop_size: usize,
    /// Coding position inside the sub-GOP
    pub subgop_pos: usize,
}

/// A picture waiting for the anchor closing its sub-GOP.
#[derive(Debug)]
struct Pending {
    picture: Picture,
    display_order: i64,
    pts: i64,
}

/// GOP reorder queue.
///
/// * All-intra (`intra_period_max == 1`): every picture is an IDR.
/// * Low delay (no B pictures): pictures are released as soon as they arrive, as P (or F)
///   pictures with an intra picture every `intra_period_max` pictures.
/// * Random access: B pictures are held until the next anchor arrives, then the sub-GOP is
///   released following the hierarchical coding order of [`SUBGOP_ORDER`].
pub struct Lookahead {
    num_bframes: usize,
    intra_period_max: u64,
    open_gop: bool,
    anchor_type: SliceType,
    frame_duration: i64,
    /// Reorder depth of the longest sub-GOP
    depth: i64,

    /// Pictures submitted since the last intra picture
    gop_frames: u64,
    submitted: u64,
    pending: Vec<Pending>,
    last_subgop_size: usize,

    next_coi: i64,
    gop_idr_coi: i64,

    /// Presentation timestamps of the pictures not used for a dts yet, starting at `pts_base`
    display_pts: VecDeque<i64>,
    pts_base: i64,
    first_pts: Option<i64>,
}

impl Lookahead {
    pub fn new(config: &EncoderConfig) -> Self {
        let num_bframes = if config.is_all_intra() {
            0
        } else {
            config.num_bframes as usize
        };

        let anchor_type = if config.use_f_frames {
            SliceType::F
        } else {
            SliceType::P
        };

        Self {
            num_bframes,
            intra_period_max: u64::from(config.intra_period_max),
            open_gop: config.open_gop,
            anchor_type,
            frame_duration: config.frame_duration,
            depth: reorder_depth(num_bframes + 1) as i64,
            gop_frames: 0,
            submitted: 0,
            pending: vec![],
            last_subgop_size: 1,
            next_coi: 0,
            gop_idr_coi: 0,
            display_pts: VecDeque::new(),
            pts_base: 0,
            first_pts: None,
        }
    }

    /// Number of pictures held back waiting for an anchor.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Adds the next picture in presentation order and returns the pictures that became ready,
    /// in coding order.
    pub fn push(&mut self, picture: Picture, display_order: i64, pts: i64) -> Vec<LookaheadEntry> {
        let intra_due = self.submitted == 0
            || self.intra_period_max == 1
            || (self.intra_period_max > 0 && self.gop_frames >= self.intra_period_max);
        let first = self.submitted == 0;

        self.submitted += 1;
        self.first_pts.get_or_insert(pts);
        self.display_pts.push_back(pts);
        self.gop_frames = if intra_due { 1 } else { self.gop_frames + 1 };

        let current = Pending {
            picture,
            display_order,
            pts,
        };

        let mut ready = vec![];
        if intra_due {
            if self.open_gop && !first {
                log::trace!("open GOP intra anchor at display order {display_order}");
                self.pending.push(current);
                self.release_subgop(SliceType::I, false, &mut ready);
            } else {
                if !self.pending.is_empty() {
                    log::debug!(
                        "IDR at display order {display_order}, closing the sub-GOP of {} pictures early",
                        self.pending.len()
                    );
                    self.release_subgop(self.anchor_type, false, &mut ready);
                }

                self.pending.push(current);
                self.release_subgop(SliceType::I, true, &mut ready);
            }
        } else if self.pending.len() == self.num_bframes {
            self.pending.push(current);
            self.release_subgop(self.anchor_type, false, &mut ready);
        } else {
            log::trace!("holding display order {display_order} for its anchor");
            self.pending.push(current);
        }

        ready
    }

    /// Releases every held picture. The last one is promoted to the anchor of a shortened
    /// sub-GOP.
    pub fn flush(&mut self) -> Vec<LookaheadEntry> {
        let mut ready = vec![];
        if !self.pending.is_empty() {
            log::debug!("flushing {} held pictures", self.pending.len());
            self.release_subgop(self.anchor_type, false, &mut ready);
        }

        ready
    }

    /// Releases `self.pending` as a sub-GOP closed by its last picture, which gets
    /// `anchor_type`.
    fn release_subgop(
        &mut self,
        anchor_type: SliceType,
        anchor_is_idr: bool,
        ready: &mut Vec<LookaheadEntry>,
    ) {
        let size = self.pending.len();
        let prev_subgop_size = std::mem::replace(&mut self.last_subgop_size, size);
        let mut slots: Vec<Option<Pending>> = self.pending.drain(..).map(Some).collect();

        for (pos, &offset) in SUBGOP_ORDER[size].iter().enumerate() {
            let Some(pending) = slots[offset - 1].take() else {
                continue;
            };

            let is_anchor = offset == size;
            let slice_type = if is_anchor { anchor_type } else { SliceType::B };

            let coi = self.next_coi;
            self.next_coi += 1;
            if slice_type == SliceType::I {
                self.gop_idr_coi = coi;
            }

            let entry = LookaheadEntry {
                picture: pending.picture,
                display_order: pending.display_order,
                pts: pending.pts,
                dts: self.dts(coi),
                slice_type,
                is_keyframe: is_anchor && anchor_is_idr,
                coi,
                gop_idr_coi: self.gop_idr_coi,
                subgop_size: size,
                prev_subgop_size,
                subgop_pos: pos,
            };

            log::trace!(
                "release display order {} as {:?} coi={} pts={} dts={}",
                entry.display_order,
                entry.slice_type,
                entry.coi,
                entry.pts,
                entry.dts
            );

            ready.push(entry);
        }
    }

    /// Decoding timestamp of the picture coded at `coi`: the presentation timestamp of the
    /// picture displayed `depth` positions earlier, so that it never exceeds the pts of any
    /// picture coded after it.
    fn dts(&mut self, coi: i64) -> i64 {
        let index = coi - self.depth;
        if index < 0 {
            return self.first_pts.unwrap_or(0) + index * self.frame_duration;
        }

        // Every picture before `index` in presentation order is done with.
        while self.pts_base < index {
            self.display_pts.pop_front();
            self.pts_base += 1;
        }

        // A coded picture was always submitted, so `index` is already known.
        self.display_pts
            .front()
            .copied()
            .unwrap_or_else(|| self.first_pts.unwrap_or(0) + index * self.frame_duration)
    }
}
