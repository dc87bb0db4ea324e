// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the pipeline run so we can
//! test it in isolation.
//!
//! It implements a deterministic toy codec: DC intra prediction, co-located inter prediction
//! with a small vertical search, a shift quantizer and a CRC32 running over the quantized
//! coefficients in place of an arithmetic coder. Its output is only meant to be compared with
//! itself.

use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::WriteBytesExt;
use crc32fast::Hasher;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::EncoderBackend;
use crate::backend::FrameInfo;
use crate::backend::LcuContext;
use crate::frame::Frame;
use crate::SliceType;

/// Start code prefixing every packet produced by [`DummyBackend::serialize_nal_units`].
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

const HEADER_LEN: usize = START_CODE.len() + 7;

/// Header of a packet produced by [`DummyBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub slice_type: SliceType,
    pub temporal_id: u8,
    pub coi: u32,
    pub qp: u8,
    pub num_slices: u8,
}

/// Parses the header of a packet produced by [`DummyBackend`].
pub fn parse_packet_header(data: &[u8]) -> Option<PacketHeader> {
    if data.len() < HEADER_LEN || data[..START_CODE.len()] != START_CODE {
        return None;
    }

    let data = &data[START_CODE.len()..];
    Some(PacketHeader {
        slice_type: SliceType::n(data[0] >> 4)?,
        temporal_id: data[0] & 0xf,
        coi: BigEndian::read_u32(&data[1..5]),
        qp: data[5],
        num_slices: data[6],
    })
}

pub struct DummyBackend {
    base_qp: u8,
}

impl DummyBackend {
    pub fn new(base_qp: u8) -> Self {
        Self { base_qp }
    }

    /// Quantizer step, as a shift.
    fn shift(qp: u8) -> u32 {
        u32::from(qp / 8).min(6)
    }

    /// DC of the reconstructed samples left and above (right) of the LCU.
    fn predict_intra(frame: &Frame, row: usize, col: usize) -> Vec<u8> {
        let geometry = frame.geometry();
        let lcu = geometry.lcu_size as usize;
        let stride = geometry.padded_width();

        let mut sum = 0u32;
        let mut count = 0u32;

        if row > 0 {
            let above = frame.recon_row(row - 1);
            let line = (lcu - 1) * stride;
            let end = ((col + 2) * lcu).min(stride);
            for &sample in &above[line + col * lcu..line + end] {
                sum += u32::from(sample);
                count += 1;
            }
        }

        if col > 0 {
            let current = frame.recon_row(row);
            for y in 0..lcu {
                sum += u32::from(current[y * stride + col * lcu - 1]);
                count += 1;
            }
        }

        let dc = match count {
            0 => 128,
            _ => ((sum + count / 2) / count) as u8,
        };

        vec![dc; lcu * lcu]
    }

    /// Reads the `lcu`x`lcu` reconstructed block of `frame` at (`x0`, `y0`), clamping lines to
    /// the picture.
    fn read_block(frame: &Frame, x0: usize, y0: isize) -> Vec<u8> {
        let geometry = frame.geometry();
        let lcu = geometry.lcu_size as usize;
        let stride = geometry.padded_width();
        let height = (geometry.rows * lcu) as isize;

        let mut block = Vec::with_capacity(lcu * lcu);
        for y in 0..lcu as isize {
            let line = (y0 + y).clamp(0, height - 1) as usize;
            let recon = frame.recon_row(line / lcu);
            let start = (line % lcu) * stride + x0;
            block.extend_from_slice(&recon[start..start + lcu]);
        }

        block
    }

    /// Average of the best vertically displaced block of every reference.
    fn predict_inter(ctx: &LcuContext, source: &[u8]) -> Vec<u8> {
        let geometry = ctx.frame.geometry();
        let lcu = geometry.lcu_size as usize;
        let half = (lcu / 2) as isize;
        let x0 = ctx.col * lcu;
        let y0 = (ctx.row * lcu) as isize;

        let mut sums = vec![0u32; lcu * lcu];
        for reference in ctx.refs {
            let mut best: Option<(f64, Vec<u8>)> = None;
            for dy in [0, -half, half] {
                let block = Self::read_block(reference, x0, y0 + dy);
                let sad: u32 = block
                    .iter()
                    .zip(source)
                    .map(|(&a, &b)| u32::from(a.abs_diff(b)))
                    .sum();
                let cost = f64::from(sad) + if dy == 0 { 0.0 } else { ctx.info.lambda };

                if best.as_ref().map_or(true, |(best_cost, _)| cost < *best_cost) {
                    best = Some((cost, block));
                }
            }

            if let Some((_, block)) = best {
                for (sum, sample) in sums.iter_mut().zip(block) {
                    *sum += u32::from(sample);
                }
            }
        }

        let n = ctx.refs.len().max(1) as u32;
        sums.into_iter().map(|sum| ((sum + n / 2) / n) as u8).collect()
    }

    fn source_block(frame: &Frame, row: usize, col: usize) -> Vec<u8> {
        let geometry = frame.geometry();
        let lcu = geometry.lcu_size as usize;
        let stride = geometry.padded_width();
        let input = frame.input();

        let mut block = Vec::with_capacity(lcu * lcu);
        for y in 0..lcu {
            let start = (row * lcu + y) * stride + col * lcu;
            block.extend_from_slice(&input[start..start + lcu]);
        }

        block
    }
}

impl EncoderBackend for DummyBackend {
    type EntropyState = Hasher;

    fn compute_qp_and_lambda(&self, slice_type: SliceType, qp_offset: i32) -> (u8, f64) {
        let type_offset = match slice_type {
            SliceType::I => -3,
            SliceType::P | SliceType::F => 0,
            SliceType::B => 1,
        };

        let qp = (i32::from(self.base_qp) + type_offset + qp_offset).clamp(0, 63) as u8;
        let lambda = 0.57 * 2f64.powf((f64::from(qp) - 12.0) / 3.0);

        (qp, lambda)
    }

    fn init_entropy(&self, info: &FrameInfo, slice: usize) -> Hasher {
        let seed = (info.coi as u32) ^ ((slice as u32) << 16) ^ (u32::from(info.qp) << 24);
        Hasher::new_with_initial(seed)
    }

    fn encode_lcu(
        &self,
        ctx: &LcuContext,
        state: &mut Hasher,
        out: &mut Vec<u8>,
    ) -> BackendResult<()> {
        let geometry = ctx.frame.geometry();
        let lcu = geometry.lcu_size as usize;
        let stride = geometry.padded_width();
        if ctx.row >= geometry.rows || ctx.col >= geometry.cols {
            return Err(BackendError::InvalidInput(format!(
                "LCU ({}, {}) outside of a {}x{} grid",
                ctx.row, ctx.col, geometry.cols, geometry.rows
            )));
        }

        let source = Self::source_block(ctx.frame, ctx.row, ctx.col);
        let pred = if ctx.refs.is_empty() {
            Self::predict_intra(ctx.frame, ctx.row, ctx.col)
        } else {
            Self::predict_inter(ctx, &source)
        };

        let shift = Self::shift(ctx.info.qp);
        let mut coeffs = Vec::with_capacity(2 * lcu * lcu);
        let mut recon = Vec::with_capacity(lcu * lcu);
        let mut level_sum = 0u16;
        for (&src, &pred) in source.iter().zip(&pred) {
            let level = (i16::from(src) - i16::from(pred)) >> shift;
            coeffs.write_i16::<BigEndian>(level).map_err(anyhow::Error::from)?;
            level_sum = level_sum.wrapping_add(level.unsigned_abs());
            recon.push((i16::from(pred) + (level << shift)).clamp(0, 255) as u8);
        }

        {
            let x0 = ctx.col * lcu;
            let mut row = ctx.frame.recon_row(ctx.row);
            for (y, line) in recon.chunks_exact(lcu).enumerate() {
                row[y * stride + x0..y * stride + x0 + lcu].copy_from_slice(line);
            }
        }

        state.update(&coeffs);
        out.write_u32::<BigEndian>(state.clone().finalize())
            .map_err(anyhow::Error::from)?;
        out.write_u16::<BigEndian>(level_sum)
            .map_err(anyhow::Error::from)?;

        Ok(())
    }

    fn finish_slice(&self, state: Hasher, out: &mut Vec<u8>) -> BackendResult<()> {
        out.write_u32::<BigEndian>(state.finalize())
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    fn apply_in_loop_filters(&self, frame: &Frame, row: usize) -> BackendResult<()> {
        let geometry = frame.geometry();
        if row + 1 >= geometry.rows {
            return Ok(());
        }

        let lcu = geometry.lcu_size as usize;
        let stride = geometry.padded_width();
        let last_line = (lcu - 1) * stride;

        // Only one row lock is held at a time.
        let above = frame.recon_row(row)[last_line..last_line + stride].to_vec();
        let below = frame.recon_row(row + 1)[..stride].to_vec();

        let blend = |a: u8, b: u8| ((3 * u16::from(a) + u16::from(b) + 2) / 4) as u8;

        {
            let mut recon = frame.recon_row(row);
            for (x, sample) in recon[last_line..last_line + stride].iter_mut().enumerate() {
                *sample = blend(above[x], below[x]);
            }
        }

        let mut recon = frame.recon_row(row + 1);
        for (x, sample) in recon[..stride].iter_mut().enumerate() {
            *sample = blend(below[x], above[x]);
        }

        Ok(())
    }

    fn expand_border(&self, frame: &Frame, row: usize) -> BackendResult<()> {
        let geometry = frame.geometry();
        let width = geometry.resolution.width as usize;
        let stride = geometry.padded_width();
        if width >= stride {
            return Ok(());
        }

        log::trace!("expanding row {row} from {width} to {stride} samples");

        let mut recon = frame.recon_row(row);
        for line in recon.chunks_exact_mut(stride) {
            let edge = line[width - 1];
            line[width..].fill(edge);
        }

        Ok(())
    }

    fn serialize_nal_units(
        &self,
        info: &FrameInfo,
        slices: &[Vec<u8>],
        out: &mut Vec<u8>,
    ) -> BackendResult<usize> {
        if slices.is_empty() || slices.len() > usize::from(u8::MAX) {
            return Err(BackendError::InvalidInput(format!(
                "cannot serialize {} slices",
                slices.len()
            )));
        }

        let start = out.len();
        out.extend_from_slice(&START_CODE);
        out.push(((info.slice_type as u8) << 4) | (info.temporal_id & 0xf));
        out.write_u32::<BigEndian>(info.coi as u32)
            .map_err(anyhow::Error::from)?;
        out.push(info.qp);
        out.push(slices.len() as u8);

        for slice in slices {
            out.write_u32::<BigEndian>(slice.len() as u32)
                .map_err(anyhow::Error::from)?;
            out.extend_from_slice(slice);
        }

        Ok(out.len() - start)
    }
}
