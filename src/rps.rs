// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Construction of the reference picture set (RPS) of a picture about to be encoded.
//!
//! The static [`template::GopTemplate`] says which pictures a coding position should reference
//! and evict. [`RpsBuilder`] resolves that against the live [`FramePool`] state, repairs the
//! result when the template does not match the pool, and takes the reference holds.

pub mod template;

use std::sync::Arc;

use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::frame::Frame;
use crate::frame::FrameIdentity;
use crate::frame_pool::FramePool;
use crate::rps::template::RpsTemplate;
use crate::SliceType;

/// Reference picture set of an encoded picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rps {
    /// Coding order deltas of the references
    pub ref_pic: Vec<i64>,
    /// Coding order deltas of the pictures evicted after this one was scheduled
    pub rm_pic: Vec<i64>,
    pub qp_offset: i32,
    pub temporal_id: u8,
    pub referenced_by_others: bool,
    /// Coding position in the sub-GOP template, `-1` if the template had to be patched. Cached
    /// per-position estimates must not be reused for patched pictures.
    pub idx_in_gop: i32,
}

impl Rps {
    pub fn num_of_ref(&self) -> usize {
        self.ref_pic.len()
    }

    pub fn num_to_rm(&self) -> usize {
        self.rm_pic.len()
    }

    pub fn is_patched(&self) -> bool {
        self.idx_in_gop < 0
    }

    fn patch(&mut self) {
        self.idx_in_gop = -1;
    }
}

/// Result of [`RpsBuilder::build`]: the RPS with the frames it resolved to.
#[derive(Debug)]
pub struct ReferenceList {
    pub rps: Rps,
    /// Referenced frames, each carrying one hold taken by the builder
    pub refs: Vec<Arc<Frame>>,
    /// Frames whose "referenced by others" hold must be dropped once the picture is scheduled
    pub removals: Vec<Arc<Frame>>,
}

pub struct RpsBuilder<'a> {
    pool: &'a FramePool,
    max_ref: usize,
    open_gop: bool,
}

impl<'a> RpsBuilder<'a> {
    pub fn new(pool: &'a FramePool, max_ref: usize, open_gop: bool) -> Self {
        Self {
            pool,
            max_ref,
            open_gop,
        }
    }

    /// Builds the RPS of `frame`, which must already carry its identity and slice type, from
    /// the template of coding position `idx_in_gop`.
    ///
    /// On success one hold was taken on every returned reference. Fails with
    /// [`EncodeError::ReferenceUnavailable`] if an inter picture ends up with no usable
    /// template reference, in which case no hold was taken.
    pub fn build(
        &self,
        frame: &Arc<Frame>,
        template: &RpsTemplate,
        idx_in_gop: usize,
    ) -> EncodeResult<ReferenceList> {
        let id = frame.identity();
        let slice_type = frame.slice_type();

        let mut rps = Rps {
            ref_pic: vec![],
            rm_pic: vec![],
            qp_offset: template.qp_offset,
            temporal_id: template.temporal_id,
            referenced_by_others: template.referenced_by_others,
            idx_in_gop: idx_in_gop as i32,
        };

        let mut refs = vec![];
        if !slice_type.is_intra() {
            refs = self.resolve_template(frame, &id, slice_type, template, &mut rps);
            if refs.is_empty() {
                log::error!(
                    "no reference available for coi={} (template {:?})",
                    id.coi,
                    template.ref_pic
                );
                return Err(EncodeError::ReferenceUnavailable { coi: id.coi });
            }

            if slice_type.is_forward() {
                self.extend_forward(frame, &id, slice_type, &mut refs);
            } else {
                self.repair_bframe(frame, &id, &mut refs, &mut rps);
            }
        }

        for reference in &refs {
            reference.add_ref();
        }
        rps.ref_pic = refs.iter().map(|r| id.coi - r.coi()).collect();

        let removals = self.removal_list(frame, &id, template);
        rps.rm_pic = removals.iter().map(|r| id.coi - r.coi()).collect();

        log::debug!(
            "rps coi={} type={:?} refs={:?} rm={:?} idx_in_gop={}",
            id.coi,
            slice_type,
            rps.ref_pic,
            rps.rm_pic,
            rps.idx_in_gop
        );

        frame.set_rps(rps.clone());

        Ok(ReferenceList {
            rps,
            refs,
            removals,
        })
    }

    /// Whether `candidate` can be referenced by the picture `id` given the references picked so
    /// far.
    fn is_eligible(
        &self,
        frame: &Arc<Frame>,
        candidate: &Arc<Frame>,
        id: &FrameIdentity,
        slice_type: SliceType,
        refs: &[Arc<Frame>],
    ) -> bool {
        if Arc::ptr_eq(frame, candidate) || refs.iter().any(|r| Arc::ptr_eq(r, candidate)) {
            return false;
        }

        let coi = candidate.coi();
        coi >= 0
            && coi < id.coi
            && candidate.is_reference()
            && (coi >= id.gop_idr_coi || self.may_cross_idr(slice_type))
    }

    /// Open-GOP B pictures may reference pictures preceding the last random access point.
    fn may_cross_idr(&self, slice_type: SliceType) -> bool {
        self.open_gop && slice_type == SliceType::B
    }

    /// Resolves the template references against the pool, falling back on the IDR picture for
    /// references that are missing.
    fn resolve_template(
        &self,
        frame: &Arc<Frame>,
        id: &FrameIdentity,
        slice_type: SliceType,
        template: &RpsTemplate,
        rps: &mut Rps,
    ) -> Vec<Arc<Frame>> {
        let mut refs: Vec<Arc<Frame>> = vec![];

        for &delta in &template.ref_pic {
            if refs.len() >= self.max_ref {
                break;
            }

            let target = id.coi - delta;
            if target < id.gop_idr_coi && !self.may_cross_idr(slice_type) {
                log::warn!(
                    "coi={} template reference {target} precedes IDR {}, dropped",
                    id.coi,
                    id.gop_idr_coi
                );
                rps.patch();
                continue;
            }

            match self.pool.find_by_coi(target) {
                Some(candidate) if self.is_eligible(frame, &candidate, id, slice_type, &refs) => {
                    refs.push(candidate)
                }
                _ => {
                    rps.patch();
                    match self.pool.find_by_coi(id.gop_idr_coi) {
                        Some(idr) if self.is_eligible(frame, &idr, id, slice_type, &refs) => {
                            log::warn!(
                                "coi={} reference {target} unavailable, using IDR {}",
                                id.coi,
                                id.gop_idr_coi
                            );
                            refs.push(idr);
                        }
                        _ => log::warn!("coi={} reference {target} unavailable", id.coi),
                    }
                }
            }
        }

        refs
    }

    /// Makes sure the references of a B picture bracket it in display order, otherwise replaces
    /// them by the closest eligible pictures on either side.
    fn repair_bframe(
        &self,
        frame: &Arc<Frame>,
        id: &FrameIdentity,
        refs: &mut Vec<Arc<Frame>>,
        rps: &mut Rps,
    ) {
        let current = id.display_order;
        let brackets = refs.len() >= 2
            && refs[0].display_order() < current
            && current < refs[1].display_order();
        if brackets {
            return;
        }

        let candidates: Vec<_> = self
            .pool
            .frames()
            .iter()
            .filter(|f| self.is_eligible(frame, f, id, SliceType::B, &[]))
            .collect();

        let forward = candidates
            .iter()
            .filter(|f| f.display_order() < current)
            .max_by_key(|f| f.display_order());
        let backward = candidates
            .iter()
            .filter(|f| f.display_order() > current)
            .min_by_key(|f| f.display_order());

        match (forward, backward) {
            (Some(forward), Some(backward)) => {
                log::debug!(
                    "coi={} B references rebuilt around display order {current}: {} and {}",
                    id.coi,
                    forward.display_order(),
                    backward.display_order()
                );
                *refs = vec![Arc::clone(forward), Arc::clone(backward)];
                rps.patch();
            }
            _ => log::warn!(
                "coi={} no pair of references brackets display order {current}",
                id.coi
            ),
        }
    }

    /// Greedily adds the most recent eligible past pictures to a P/F picture, up to `max_ref`.
    fn extend_forward(
        &self,
        frame: &Arc<Frame>,
        id: &FrameIdentity,
        slice_type: SliceType,
        refs: &mut Vec<Arc<Frame>>,
    ) {
        while refs.len() < self.max_ref {
            let next = self
                .pool
                .frames()
                .iter()
                .filter(|f| f.display_order() < id.display_order)
                .filter(|f| self.is_eligible(frame, f, id, slice_type, refs.as_slice()))
                .max_by_key(|f| f.coi());

            match next {
                Some(next) => refs.push(Arc::clone(next)),
                None => break,
            }
        }
    }

    /// Resolves the template evictions. An IDR picture additionally evicts every older
    /// reference.
    fn removal_list(
        &self,
        frame: &Arc<Frame>,
        id: &FrameIdentity,
        template: &RpsTemplate,
    ) -> Vec<Arc<Frame>> {
        let mut removals: Vec<Arc<Frame>> = vec![];

        for &delta in &template.rm_pic {
            let target = id.coi - delta;
            let Some(candidate) = self.pool.find_by_coi(target) else {
                continue;
            };

            // A picture of a higher temporal layer never evicts one of a lower layer.
            if !candidate.is_reference() || candidate.temporal_id() < template.temporal_id {
                log::trace!("coi={} keeps {target}", id.coi);
                continue;
            }

            if !removals.iter().any(|r| Arc::ptr_eq(r, &candidate)) {
                removals.push(candidate);
            }
        }

        if frame.is_keyframe() {
            for candidate in self.pool.frames() {
                let coi = candidate.coi();
                if coi >= 0
                    && coi < id.coi
                    && candidate.is_reference()
                    && !removals.iter().any(|r| Arc::ptr_eq(r, candidate))
                {
                    removals.push(Arc::clone(candidate));
                }
            }
        }

        removals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameGeometry;
    use crate::frame::ENCODE_HOLDS;
    use crate::utils::ExitFlag;
    use crate::Picture;
    use crate::Resolution;

    struct Fixture {
        pool: FramePool,
        picture: Picture,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            let resolution = Resolution::from((16, 16));
            Self {
                pool: FramePool::new(
                    capacity,
                    FrameGeometry::new(resolution, 16, 16),
                    256,
                    ExitFlag::new(),
                ),
                picture: Picture::from_fn(resolution, |_, _| 0),
            }
        }

        /// Puts a picture in the pool as if it had been scheduled, without its encode holds.
        fn add(
            &self,
            display_order: i64,
            coi: i64,
            slice_type: SliceType,
            referenced: bool,
        ) -> Arc<Frame> {
            let frame = self.acquire(display_order, coi, slice_type, referenced, 0);
            for _ in 0..ENCODE_HOLDS {
                self.pool.release(&frame);
            }
            self.pool.retire(&frame);
            frame
        }

        fn acquire(
            &self,
            display_order: i64,
            coi: i64,
            slice_type: SliceType,
            referenced: bool,
            temporal_id: u8,
        ) -> Arc<Frame> {
            let frame = self
                .pool
                .acquire_free_frame(display_order, referenced)
                .unwrap();
            let id = FrameIdentity {
                display_order,
                coi,
                gop_idr_coi: 0,
            };
            frame.assign(
                id,
                slice_type,
                coi == 0,
                temporal_id,
                &self.picture,
            );
            frame
        }
    }

    fn template(ref_pic: Vec<i64>, rm_pic: Vec<i64>) -> RpsTemplate {
        RpsTemplate {
            ref_pic,
            rm_pic,
            referenced_by_others: true,
            ..Default::default()
        }
    }

    fn displays(refs: &[Arc<Frame>]) -> Vec<i64> {
        refs.iter().map(|r| r.display_order()).collect()
    }

    #[test]
    fn intra_has_no_references_but_keeps_removals() {
        let fixture = Fixture::new(4);
        let old = fixture.add(0, 0, SliceType::I, true);
        let frame = fixture.acquire(1, 1, SliceType::I, true, 0);

        let list = RpsBuilder::new(&fixture.pool, 2, false)
            .build(&frame, &template(vec![1], vec![1]), 0)
            .unwrap();
        assert!(list.refs.is_empty());
        assert_eq!(list.rps.rm_pic, vec![1]);
        assert!(Arc::ptr_eq(&list.removals[0], &old));
        assert_eq!(old.reference_count(), 1);
    }

    #[test]
    fn template_references_take_holds() {
        let fixture = Fixture::new(4);
        let i0 = fixture.add(0, 0, SliceType::I, true);
        let p1 = fixture.add(1, 1, SliceType::P, true);
        let frame = fixture.acquire(2, 2, SliceType::P, true, 0);

        let list = RpsBuilder::new(&fixture.pool, 1, false)
            .build(&frame, &template(vec![1], vec![]), 0)
            .unwrap();
        assert_eq!(displays(&list.refs), vec![1]);
        assert_eq!(list.rps.ref_pic, vec![1]);
        assert_eq!(list.rps.num_of_ref(), 1);
        assert!(!list.rps.is_patched());
        assert_eq!(p1.reference_count(), 2);
        assert_eq!(i0.reference_count(), 1);
        assert_eq!(frame.rps(), Some(list.rps));
    }

    #[test]
    fn forward_extension_up_to_max_ref() {
        let fixture = Fixture::new(5);
        fixture.add(0, 0, SliceType::I, true);
        fixture.add(1, 1, SliceType::P, true);
        // Not a reference picture, never picked.
        fixture.add(2, 2, SliceType::P, false);
        let frame = fixture.acquire(3, 3, SliceType::P, true, 0);

        let list = RpsBuilder::new(&fixture.pool, 3, false)
            .build(&frame, &template(vec![2], vec![]), 0)
            .unwrap();
        assert_eq!(displays(&list.refs), vec![1, 0]);
        assert_eq!(list.rps.ref_pic, vec![2, 3]);
    }

    #[test]
    fn missing_reference_falls_back_on_idr() {
        let fixture = Fixture::new(4);
        let i0 = fixture.add(0, 0, SliceType::I, true);
        let frame = fixture.acquire(3, 3, SliceType::P, true, 0);

        let list = RpsBuilder::new(&fixture.pool, 1, false)
            .build(&frame, &template(vec![1], vec![]), 0)
            .unwrap();
        assert!(Arc::ptr_eq(&list.refs[0], &i0));
        assert!(list.rps.is_patched());
        assert_eq!(list.rps.idx_in_gop, -1);
    }

    #[test]
    fn reference_before_idr_is_unavailable() {
        let fixture = Fixture::new(4);
        let i0 = fixture.add(0, 0, SliceType::I, true);
        let frame = fixture.acquire(1, 1, SliceType::P, true, 0);

        let res = RpsBuilder::new(&fixture.pool, 2, false).build(
            &frame,
            &template(vec![5, 9], vec![]),
            0,
        );
        assert!(matches!(
            res,
            Err(EncodeError::ReferenceUnavailable { coi: 1 })
        ));
        // Nothing was taken.
        assert_eq!(i0.reference_count(), 1);
    }

    #[test]
    fn bframe_references_bracket() {
        let fixture = Fixture::new(6);
        fixture.add(0, 0, SliceType::I, true);
        fixture.add(4, 1, SliceType::P, true);
        fixture.add(2, 2, SliceType::B, true);
        let frame = fixture.acquire(3, 3, SliceType::B, false, 2);

        // Both template references land before the picture in display order.
        let list = RpsBuilder::new(&fixture.pool, 2, false)
            .build(&frame, &template(vec![1, 3], vec![]), 3)
            .unwrap();
        assert_eq!(displays(&list.refs), vec![2, 4]);
        assert!(list.rps.is_patched());
        assert_eq!(list.rps.ref_pic, vec![1, 2]);
    }

    #[test]
    fn bframe_template_match_is_kept() {
        let fixture = Fixture::new(6);
        fixture.add(0, 0, SliceType::I, true);
        fixture.add(4, 1, SliceType::P, true);
        let frame = fixture.acquire(2, 2, SliceType::B, true, 1);

        let list = RpsBuilder::new(&fixture.pool, 2, false)
            .build(&frame, &template(vec![2, 1], vec![]), 1)
            .unwrap();
        assert_eq!(displays(&list.refs), vec![0, 4]);
        assert_eq!(list.rps.idx_in_gop, 1);
    }

    #[test]
    fn removals_filtered() {
        let fixture = Fixture::new(6);
        let i0 = fixture.add(0, 0, SliceType::I, true);
        // Still being encoded, but not a reference picture.
        let leaf = fixture.acquire(1, 1, SliceType::P, false, 0);
        let frame = fixture.acquire(2, 2, SliceType::P, true, 0);

        // Non-reference and missing pictures are dropped from the list.
        let list = RpsBuilder::new(&fixture.pool, 1, false)
            .build(&frame, &template(vec![2], vec![1, 2, 7]), 0)
            .unwrap();
        assert_eq!(list.rps.rm_pic, vec![2]);
        assert!(Arc::ptr_eq(&list.removals[0], &i0));
        assert_eq!(leaf.reference_count(), ENCODE_HOLDS);
    }

    #[test]
    fn higher_layer_does_not_evict_lower_layer() {
        let fixture = Fixture::new(6);
        fixture.add(0, 0, SliceType::I, true);
        let p = fixture.add(4, 1, SliceType::P, true);
        let frame = fixture.acquire(2, 2, SliceType::B, false, 1);

        let template = RpsTemplate {
            ref_pic: vec![2, 1],
            rm_pic: vec![1],
            temporal_id: 1,
            ..Default::default()
        };
        let list = RpsBuilder::new(&fixture.pool, 2, false)
            .build(&frame, &template, 1)
            .unwrap();
        assert!(list.removals.is_empty());
        assert!(p.is_reference());
    }

    #[test]
    fn idr_evicts_everything_older() {
        let fixture = Fixture::new(6);
        fixture.add(0, 0, SliceType::I, true);
        fixture.add(1, 1, SliceType::P, true);
        fixture.add(2, 2, SliceType::P, true);

        let frame = fixture.pool.acquire_free_frame(3, true).unwrap();
        frame.assign(
            FrameIdentity {
                display_order: 3,
                coi: 3,
                gop_idr_coi: 3,
            },
            SliceType::I,
            true,
            0,
            &fixture.picture,
        );

        let list = RpsBuilder::new(&fixture.pool, 1, false)
            .build(&frame, &template(vec![1], vec![]), 0)
            .unwrap();
        assert!(list.refs.is_empty());
        assert_eq!(list.removals.len(), 3);
        assert_eq!(list.rps.num_to_rm(), 3);
    }
}
