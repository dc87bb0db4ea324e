// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the pixel-domain side of the encoder.
//!
//! A backend provides the per-LCU coding (prediction, transform, quantization and entropy
//! coding), the in-loop filters and the bitstream serialization. The schedulers of this crate
//! decide when each of these runs and on which buffers; the backend never synchronizes on its
//! own.

pub mod dummy;

use std::sync::Arc;

use thiserror::Error;

use crate::frame::Frame;
use crate::SliceType;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Frame-level parameters fixed when a picture is bound to a frame context.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameInfo {
    pub coi: i64,
    pub display_order: i64,
    pub slice_type: SliceType,
    pub is_keyframe: bool,
    pub temporal_id: u8,
    pub qp: u8,
    pub lambda: f64,
}

/// Everything needed to code one LCU.
pub struct LcuContext<'a> {
    pub info: &'a FrameInfo,
    /// Picture being coded
    pub frame: &'a Frame,
    /// Its references, forward first. The rows around `row` are fully reconstructed.
    pub refs: &'a [Arc<Frame>],
    pub row: usize,
    pub col: usize,
}

pub trait EncoderBackend: Send + Sync + 'static {
    /// State of the arithmetic coder. Snapshots of it are handed from one LCU row to the next,
    /// so the coded output does not depend on how rows are spread over threads.
    type EntropyState: Clone + Send + 'static;

    /// Returns the quantization parameter and the Lagrangian multiplier of a picture.
    fn compute_qp_and_lambda(&self, slice_type: SliceType, qp_offset: i32) -> (u8, f64);

    /// Returns the entropy coder state at the start of slice `slice`.
    fn init_entropy(&self, info: &FrameInfo, slice: usize) -> Self::EntropyState;

    /// Codes one LCU: reconstructs it in `ctx.frame` and appends its bits to `out`.
    ///
    /// The LCUs to the left and above right of `(ctx.row, ctx.col)` are reconstructed; nothing
    /// else of the current row or of the row above is.
    fn encode_lcu(
        &self,
        ctx: &LcuContext,
        state: &mut Self::EntropyState,
        out: &mut Vec<u8>,
    ) -> BackendResult<()>;

    /// Terminates a slice whose last LCU was just coded with `state`.
    fn finish_slice(&self, state: Self::EntropyState, out: &mut Vec<u8>) -> BackendResult<()>;

    /// Filters the edge between LCU rows `row` and `row + 1`. Both are coded.
    fn apply_in_loop_filters(&self, frame: &Frame, row: usize) -> BackendResult<()>;

    /// Pads LCU row `row` beyond the visible area once it is final.
    fn expand_border(&self, frame: &Frame, row: usize) -> BackendResult<()>;

    /// Wraps the sealed slices of a picture into NAL units appended to `out`. Returns the
    /// number of bytes written.
    fn serialize_nal_units(
        &self,
        info: &FrameInfo,
        slices: &[Vec<u8>],
        out: &mut Vec<u8>,
    ) -> BackendResult<usize>;
}
