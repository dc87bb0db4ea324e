// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::ops::Range;

use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::rps::template::RpsTemplate;
use crate::Resolution;

/// Largest supported number of consecutive B pictures, ie. sub-GOPs of up to 8 pictures.
pub const MAX_BFRAMES: u32 = 7;

/// Largest supported number of references of a single picture.
pub const MAX_REFS: usize = 4;

const MIN_LCU_SIZE: u32 = 8;
const MAX_LCU_SIZE: u32 = 64;
const MAX_QP: u8 = 63;

/// Static parameters of an encoding session.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Visible resolution of the submitted pictures
    pub resolution: Resolution,
    /// Size of the largest coding unit, in samples
    pub lcu_size: u32,
    /// Vertical motion search range, in samples
    pub search_range: u32,
    /// Number of consecutive B pictures between two anchors
    pub num_bframes: u32,
    /// Distance between intra pictures. 0 means only the first picture is intra coded, 1 means
    /// all pictures are.
    pub intra_period_max: u32,
    /// Intra pictures inserted after the first one are non-IDR random access points, B pictures
    /// may reference across them.
    pub open_gop: bool,
    /// Code inter anchors as F pictures instead of P pictures.
    pub use_f_frames: bool,
    /// Maximum number of references of a single picture
    pub max_ref: usize,
    /// Number of frame contexts, ie. pictures encoded concurrently
    pub frame_threads: usize,
    /// Number of row contexts shared by all frame contexts
    pub row_threads: usize,
    /// Run entropy coding on a dedicated thread instead of the frame thread
    pub aec_thread: bool,
    /// Number of slices per picture
    pub num_slices: usize,
    /// Quantization parameter of the anchors
    pub base_qp: u8,
    /// Number of frame slots. `None` derives it from the other parameters.
    pub frame_pool_size: Option<usize>,
    /// Distance in display order after which a still referenced, idle frame slot may be
    /// recycled when no slot is free.
    pub stale_frame_distance: i64,
    /// Duration of a picture in pts units
    pub frame_duration: i64,
    /// Replaces the derived reference structure of a full sub-GOP, one entry per coding
    /// position.
    pub gop_template: Option<Vec<RpsTemplate>>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            lcu_size: 64,
            search_range: 64,
            num_bframes: 3,
            intra_period_max: 64,
            open_gop: false,
            use_f_frames: false,
            max_ref: 2,
            frame_threads: 3,
            row_threads: 4,
            aec_thread: true,
            num_slices: 1,
            base_qp: 32,
            frame_pool_size: None,
            stale_frame_distance: 256,
            frame_duration: 1,
            gop_template: None,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> EncodeResult<()> {
        let invalid = |msg: String| Err(EncodeError::InvalidConfig(msg));

        if self.resolution.width == 0 || self.resolution.height == 0 {
            return invalid(format!("empty resolution {:?}", self.resolution));
        }

        if !self.lcu_size.is_power_of_two()
            || !(MIN_LCU_SIZE..=MAX_LCU_SIZE).contains(&self.lcu_size)
        {
            return invalid(format!("unsupported LCU size {}", self.lcu_size));
        }

        if self.num_bframes > MAX_BFRAMES {
            return invalid(format!(
                "{} B frames requested, at most {MAX_BFRAMES} supported",
                self.num_bframes
            ));
        }

        if !(1..=MAX_REFS).contains(&self.max_ref) {
            return invalid(format!("max_ref {} not in 1..={MAX_REFS}", self.max_ref));
        }

        // A B picture always references the anchors on both sides.
        if self.num_bframes > 0 && self.max_ref < 2 {
            return invalid(format!(
                "{} B frames need max_ref of at least 2, got {}",
                self.num_bframes, self.max_ref
            ));
        }

        if self.frame_threads == 0 || self.row_threads == 0 || self.num_slices == 0 {
            return invalid("thread and slice counts must be positive".into());
        }

        if self.base_qp > MAX_QP {
            return invalid(format!("base_qp {} above {MAX_QP}", self.base_qp));
        }

        if self.stale_frame_distance <= 0 || self.frame_duration <= 0 {
            return invalid("stale_frame_distance and frame_duration must be positive".into());
        }

        if let Some(size) = self.frame_pool_size {
            if size < self.min_pool_size() {
                return invalid(format!(
                    "frame pool of {size} below the {} slots needed by {} frame contexts, \
                     {} references and {} B frames",
                    self.min_pool_size(),
                    self.frame_threads,
                    self.max_ref,
                    self.num_bframes
                ));
            }
        }

        if let Some(template) = &self.gop_template {
            if template.len() != self.subgop_size() {
                return invalid(format!(
                    "GOP template has {} entries, sub-GOP size is {}",
                    template.len(),
                    self.subgop_size()
                ));
            }

            let bad_delta = template
                .iter()
                .flat_map(|t| t.ref_pic.iter().chain(t.rm_pic.iter()))
                .any(|&delta| delta <= 0);
            if bad_delta {
                return invalid("GOP template deltas must point to earlier pictures".into());
            }
        }

        Ok(())
    }

    /// Number of pictures in a full sub-GOP: the B pictures plus their closing anchor.
    pub fn subgop_size(&self) -> usize {
        self.num_bframes as usize + 1
    }

    pub fn is_all_intra(&self) -> bool {
        self.intra_period_max == 1
    }

    /// Smallest pool that never waits on the stale fallback: one slot per frame context, the
    /// references the GOP structure keeps alive and the slot of the picture being bound.
    pub fn min_pool_size(&self) -> usize {
        self.frame_threads + self.max_ref + self.num_bframes as usize + 1
    }

    /// Number of frame slots: one per frame context plus the reference window.
    pub fn pool_capacity(&self) -> usize {
        self.frame_pool_size.unwrap_or(self.min_pool_size() + 1)
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.resolution, self.lcu_size, self.search_range)
    }
}

/// LCU grid of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub resolution: Resolution,
    pub lcu_size: u32,
    /// Picture width in LCUs
    pub cols: usize,
    /// Picture height in LCUs
    pub rows: usize,
    /// Number of reference rows needed above and below a row for motion search
    pub search_rows: usize,
}

impl FrameGeometry {
    pub fn new(resolution: Resolution, lcu_size: u32, search_range: u32) -> Self {
        let lcu = lcu_size as usize;
        Self {
            resolution,
            lcu_size,
            cols: (resolution.width as usize).div_ceil(lcu),
            rows: (resolution.height as usize).div_ceil(lcu),
            search_rows: (search_range as usize).div_ceil(lcu) + 1,
        }
    }

    /// Width of the LCU grid in samples.
    pub fn padded_width(&self) -> usize {
        self.cols * self.lcu_size as usize
    }

    /// Number of samples in one LCU row.
    pub fn row_len(&self) -> usize {
        self.padded_width() * self.lcu_size as usize
    }

    pub fn num_lcus(&self) -> usize {
        self.cols * self.rows
    }

    /// Rows of a reference picture that must be reconstructed before `row` can be motion
    /// searched against it.
    pub fn reference_rows(&self, row: usize) -> Range<usize> {
        row.saturating_sub(self.search_rows)..(row + self.search_rows + 1).min(self.rows)
    }

    /// Splits the rows into `num_slices` contiguous, as equal as possible, slices.
    pub fn slice_rows(&self, num_slices: usize) -> Vec<Range<usize>> {
        let num_slices = num_slices.clamp(1, self.rows);
        (0..num_slices)
            .map(|s| (s * self.rows / num_slices)..((s + 1) * self.rows / num_slices))
            .collect()
    }
}
