// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client-facing side of the encoder.
//!
//! [`Encoder`] accepts pictures in presentation order, reorders them in its lookahead, binds
//! them to frame contexts and hands back the coded packets in coding order. Submission blocks
//! while every frame context or every frame slot is busy; fetching never holds up the pipeline.

use bytes::Bytes;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::TryRecvError;
use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::EncoderBackend;
use crate::config::EncoderConfig;
use crate::frame_pool::PoolStats;
use crate::lookahead::Lookahead;
use crate::lookahead::LookaheadEntry;
use crate::scheduler::FrameScheduler;
use crate::scheduler::FrameTaskState;
use crate::utils::ExitFlag;
use crate::utils::POLL_INTERVAL;
use crate::BlockingMode;
use crate::Picture;
use crate::SliceType;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid picture: {0}")]
    InvalidPicture(String),
    #[error("no reference picture available for coi {coi}")]
    ReferenceUnavailable { coi: i64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("stream already flushed")]
    StreamEnded,
    #[error("encoding failed: {0}")]
    WorkerFailed(String),
    #[error("invalid internal state. This is likely a bug.")]
    InvalidInternalState,
    #[error("failed to spawn a worker thread: {0}")]
    SpawnFailed(std::io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// A coded picture.
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    /// Serialized NAL units of the picture
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub slice_type: SliceType,
    pub is_keyframe: bool,
    /// Coding order index
    pub coi: i64,
    pub display_order: i64,
    pub temporal_id: u8,
    /// Display orders of the pictures used as references, forward first
    pub ref_display_orders: Vec<i64>,
}

/// Item returned by [`Encoder::fetch_encoded_packet`].
#[derive(Clone, Debug)]
pub enum EncoderOutput {
    Packet(EncodedPacket),
    /// Every submitted picture was emitted after a [`Encoder::flush`]
    EndOfStream,
}

pub struct Encoder<B: EncoderBackend> {
    config: EncoderConfig,
    lookahead: Lookahead,
    scheduler: FrameScheduler<B>,
    output: Receiver<EncoderOutput>,
    exit: ExitFlag,

    /// Display order and pts of the last submitted picture
    last_submitted: Option<(i64, i64)>,
    /// Pictures bound to a frame context so far
    allocated: u64,
    /// Packets handed to the client so far
    fetched: u64,
    flushed: bool,
    end_of_stream_fetched: bool,
    /// Failure of an earlier call, reported by every later one
    poisoned: Option<String>,
}

impl<B: EncoderBackend> Encoder<B> {
    pub fn new(config: EncoderConfig, backend: B) -> EncodeResult<Self> {
        config.validate()?;

        let exit = ExitFlag::new();
        let (scheduler, output) = FrameScheduler::new(&config, backend, exit.clone())?;

        log::debug!(
            "encoder {}x{}: {} B frames, intra period {}, {} frame threads, {} row threads",
            config.resolution.width,
            config.resolution.height,
            config.num_bframes,
            config.intra_period_max,
            config.frame_threads,
            config.row_threads
        );

        Ok(Self {
            lookahead: Lookahead::new(&config),
            config,
            scheduler,
            output,
            exit,
            last_submitted: None,
            allocated: 0,
            fetched: 0,
            flushed: false,
            end_of_stream_fetched: false,
            poisoned: None,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.scheduler.pool().stats()
    }

    pub fn frame_task_states(&self) -> Vec<FrameTaskState> {
        self.scheduler.frame_task_states()
    }

    /// Returns an error if an earlier call or a worker failed.
    fn check_health(&mut self) -> EncodeResult<()> {
        if self.poisoned.is_none() {
            self.poisoned = self.scheduler.failure();
        }

        match &self.poisoned {
            Some(err) => Err(EncodeError::WorkerFailed(err.clone())),
            None => Ok(()),
        }
    }

    /// Stops the pipeline after a failed call.
    fn poison(&mut self, err: &EncodeError) {
        log::error!("encoder stopped: {err}");
        self.poisoned.get_or_insert_with(|| err.to_string());
        self.exit.raise();
    }

    fn validate_picture(&self, picture: &Picture, display_order: i64, pts: i64) -> EncodeResult<()> {
        if picture.resolution != self.config.resolution {
            return Err(EncodeError::InvalidPicture(format!(
                "resolution {:?} differs from the configured {:?}",
                picture.resolution, self.config.resolution
            )));
        }

        if !picture.is_consistent() {
            return Err(EncodeError::InvalidPicture(format!(
                "{} samples for a {:?} picture",
                picture.luma.len(),
                picture.resolution
            )));
        }

        match self.last_submitted {
            Some((last_display, last_pts)) if display_order <= last_display || pts <= last_pts => {
                Err(EncodeError::InvalidPicture(format!(
                    "display order {display_order} pts {pts} after display order {last_display} pts {last_pts}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Submits the next picture in presentation order.
    ///
    /// Blocks while the pipeline is saturated. Fails with [`EncodeError::ReferenceUnavailable`]
    /// if a released picture has no usable reference, after which the encoder is unusable.
    pub fn submit_picture(
        &mut self,
        picture: Picture,
        display_order: i64,
        pts: i64,
    ) -> EncodeResult<()> {
        if self.flushed {
            return Err(EncodeError::StreamEnded);
        }
        self.check_health()?;
        self.validate_picture(&picture, display_order, pts)?;

        log::trace!("submit display order {display_order} pts {pts}");
        self.last_submitted = Some((display_order, pts));

        let ready = self.lookahead.push(picture, display_order, pts);
        self.allocate(ready)
    }

    fn allocate(&mut self, ready: Vec<LookaheadEntry>) -> EncodeResult<()> {
        for entry in ready {
            if let Err(err) = self.scheduler.allocate_frame_task(entry) {
                // A wait cancelled by a failing worker reports the worker's error.
                if let EncodeError::Cancelled = err {
                    self.check_health()?;
                }

                self.poison(&err);
                return Err(err);
            }
            self.allocated += 1;
        }

        Ok(())
    }

    /// Releases the pictures held by the lookahead, waits for every picture in flight and
    /// queues the end of stream marker after the last packet.
    pub fn flush(&mut self) -> EncodeResult<()> {
        if self.flushed {
            return Ok(());
        }
        self.check_health()?;

        let ready = self.lookahead.flush();
        self.allocate(ready)?;
        self.flushed = true;

        if let Err(err) = self.scheduler.finish() {
            self.check_health()?;
            return Err(err);
        }

        log::debug!("flushed after {} pictures", self.allocated);
        Ok(())
    }

    /// Returns the next packet in coding order, or the end of stream marker after a flush.
    ///
    /// In blocking mode, waits as long as a submitted picture has not been emitted yet. Returns
    /// `None` if there is nothing to wait for.
    pub fn fetch_encoded_packet(
        &mut self,
        mode: BlockingMode,
    ) -> EncodeResult<Option<EncoderOutput>> {
        loop {
            let received = match mode {
                BlockingMode::NonBlocking => self.output.try_recv().map_err(|err| match err {
                    TryRecvError::Empty => None,
                    TryRecvError::Disconnected => Some(EncodeError::InvalidInternalState),
                }),
                BlockingMode::Blocking => {
                    if self.end_of_stream_fetched
                        || (self.fetched == self.allocated && !self.flushed)
                    {
                        match self.output.try_recv() {
                            Ok(output) => Ok(output),
                            Err(_) => return Ok(None),
                        }
                    } else {
                        self.output
                            .recv_timeout(POLL_INTERVAL)
                            .map_err(|err| match err {
                                RecvTimeoutError::Timeout => None,
                                RecvTimeoutError::Disconnected => {
                                    Some(EncodeError::InvalidInternalState)
                                }
                            })
                    }
                }
            };

            match received {
                Ok(output) => {
                    match &output {
                        EncoderOutput::Packet(_) => self.fetched += 1,
                        EncoderOutput::EndOfStream => self.end_of_stream_fetched = true,
                    }
                    return Ok(Some(output));
                }
                Err(Some(err)) => return Err(err),
                Err(None) => {
                    // Nothing ready. Packets emitted before a failure were returned above.
                    self.check_health()?;
                    if mode == BlockingMode::NonBlocking {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl<B: EncoderBackend> Drop for Encoder<B> {
    fn drop(&mut self) {
        // Unblocks every job still waiting, so the worker pools can be joined.
        self.exit.raise();
    }
}

/// Encodes every picture of `producer`, then flushes the encoder, passing each packet to
/// `consumer` as soon as it is available.
pub fn simple_encode_loop<B, P>(
    encoder: &mut Encoder<B>,
    producer: &mut P,
    mut consumer: impl FnMut(EncodedPacket),
) -> EncodeResult<()>
where
    B: EncoderBackend,
    P: Iterator<Item = (Picture, i64, i64)>,
{
    for (picture, display_order, pts) in producer.by_ref() {
        encoder.submit_picture(picture, display_order, pts)?;
        while let Some(output) = encoder.fetch_encoded_packet(BlockingMode::NonBlocking)? {
            if let EncoderOutput::Packet(packet) = output {
                consumer(packet);
            }
        }
    }

    encoder.flush()?;
    while let Some(output) = encoder.fetch_encoded_packet(BlockingMode::Blocking)? {
        match output {
            EncoderOutput::Packet(packet) => consumer(packet),
            EncoderOutput::EndOfStream => break,
        }
    }

    Ok(())
}
