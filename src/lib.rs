// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scheduling and reference-lifetime core of a frame- and row-parallel video encoder.
//!
//! Pictures are submitted in presentation order to an [`encoder::Encoder`]. The
//! [`lookahead::Lookahead`] reorders them into coding order, the [`scheduler::FrameScheduler`]
//! binds each one to a frame context and a [`frame_pool::FramePool`] slot, the row scheduler
//! encodes its LCU rows as a wavefront, and the output re-sequencer hands the coded packets back
//! in strict coding order. The pixel-domain work is delegated to an
//! [`backend::EncoderBackend`].

pub mod backend;
pub mod config;
pub mod encoder;
pub mod frame;
pub mod frame_pool;
pub mod lookahead;
pub mod rps;
pub mod scheduler;
pub mod utils;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Coding type of a picture.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, enumn::N)]
pub enum SliceType {
    /// Intra coded, no references.
    I = 0,
    /// Forward predicted from past pictures.
    P = 1,
    /// Forward predicted, multi-hypothesis variant of P.
    F = 2,
    /// Bi-directionally predicted from one past and one future picture.
    B = 3,
}

impl SliceType {
    pub fn is_intra(&self) -> bool {
        matches!(self, SliceType::I)
    }

    /// P and F pictures: inter coded using past pictures only.
    pub fn is_forward(&self) -> bool {
        matches!(self, SliceType::P | SliceType::F)
    }
}

/// Instructs the encoder on whether it should block when fetching output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    Blocking,
    NonBlocking,
}

impl Default for BlockingMode {
    fn default() -> Self {
        Self::Blocking
    }
}

/// A raw 8-bit luma picture as submitted by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Picture {
    pub resolution: Resolution,
    /// Row-major samples, `resolution.width` per line without padding.
    pub luma: Vec<u8>,
}

impl Picture {
    pub fn new(resolution: Resolution, luma: Vec<u8>) -> Self {
        Self { resolution, luma }
    }

    /// Creates a picture whose sample at (`x`, `y`) is `f(x, y)`.
    pub fn from_fn(resolution: Resolution, mut f: impl FnMut(u32, u32) -> u8) -> Self {
        let mut luma = Vec::with_capacity(resolution.get_area());
        for y in 0..resolution.height {
            for x in 0..resolution.width {
                luma.push(f(x, y));
            }
        }

        Self { resolution, luma }
    }

    pub fn is_consistent(&self) -> bool {
        self.luma.len() == self.resolution.get_area()
    }
}
