// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Condvar;
use std::sync::Mutex;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncodedPacket;
use crate::encoder::EncoderOutput;
use crate::utils::wait_until;
use crate::utils::ExitFlag;

struct SequencerState {
    /// Output turn of the next packet to emit
    next_turn: u64,
    end_of_stream: bool,
}

/// Re-sequences packets finished out of order by the frame contexts into coding order.
///
/// Producers block in [`OutputSequencer::deliver`] until their turn comes. The consumer side is
/// a plain channel and never blocks the pipeline.
pub(crate) struct OutputSequencer {
    state: Mutex<SequencerState>,
    cond: Condvar,
    sender: Sender<EncoderOutput>,
}

impl OutputSequencer {
    pub(crate) fn new() -> (Self, Receiver<EncoderOutput>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let sequencer = Self {
            state: Mutex::new(SequencerState {
                next_turn: 0,
                end_of_stream: false,
            }),
            cond: Condvar::new(),
            sender,
        };

        (sequencer, receiver)
    }

    /// Emits `packet` once every packet of an earlier `turn` was emitted.
    pub(crate) fn deliver(
        &self,
        turn: u64,
        packet: EncodedPacket,
        exit: &ExitFlag,
    ) -> EncodeResult<()> {
        let state = self.state.lock().unwrap();
        let mut state = wait_until(state, &self.cond, exit, |state| state.next_turn == turn)?;

        if state.end_of_stream {
            return Err(EncodeError::StreamEnded);
        }

        log::trace!(
            "emitting coi={} pts={} dts={} ({} bytes)",
            packet.coi,
            packet.pts,
            packet.dts,
            packet.data.len()
        );

        // The receiver lives as long as the encoder that owns this sequencer.
        self.sender
            .send(EncoderOutput::Packet(packet))
            .map_err(|_| EncodeError::InvalidInternalState)?;
        state.next_turn += 1;
        drop(state);

        self.cond.notify_all();
        Ok(())
    }

    /// Number of packets emitted so far.
    pub(crate) fn emitted(&self) -> u64 {
        self.state.lock().unwrap().next_turn
    }

    /// Emits the end of stream marker. Only the first call has an effect.
    pub(crate) fn finish(&self) -> EncodeResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.end_of_stream {
            return Ok(());
        }

        log::debug!("end of stream after {} packets", state.next_turn);
        state.end_of_stream = true;
        self.sender
            .send(EncoderOutput::EndOfStream)
            .map_err(|_| EncodeError::InvalidInternalState)
    }
}
