// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use argh::FromArgs;
use cros_encode_pipeline::backend::dummy::DummyBackend;
use cros_encode_pipeline::config::EncoderConfig;
use cros_encode_pipeline::encoder::Encoder;
use cros_encode_pipeline::encoder::EncoderOutput;
use cros_encode_pipeline::BlockingMode;
use cros_encode_pipeline::Picture;
use cros_encode_pipeline::Resolution;

/// Parallel pipeline encoder, running the dummy backend
#[derive(Debug, FromArgs)]
struct Args {
    /// input file of raw 8-bit luma frames. Synthetic frames are encoded if not given.
    #[argh(option)]
    input: Option<PathBuf>,

    /// input frames width
    #[argh(option, default = "320")]
    width: u32,

    /// input frames height
    #[argh(option, default = "240")]
    height: u32,

    /// input frames count
    #[argh(option, default = "60")]
    count: usize,

    /// number of consecutive B frames
    #[argh(option, default = "3")]
    bframes: u32,

    /// maximum distance between intra frames, 0 for a single one
    #[argh(option, default = "32")]
    intra_period: u32,

    /// number of frames encoded in parallel
    #[argh(option, default = "3")]
    frame_threads: usize,

    /// number of LCU rows encoded in parallel
    #[argh(option, default = "4")]
    row_threads: usize,

    /// number of slices per frame
    #[argh(option, default = "1")]
    slices: usize,

    /// default quantization parameter
    #[argh(option)]
    default_qp: Option<u8>,

    /// code the entropy stage inline instead of on its own thread
    #[argh(switch)]
    inline_aec: bool,

    /// allow B frames to reference across intra frames
    #[argh(switch)]
    open_gop: bool,

    /// output file to write the encoded stream to
    #[argh(option)]
    output: Option<PathBuf>,
}

/// Moving diagonal bars.
fn synthetic_picture(resolution: Resolution, n: usize) -> Picture {
    Picture::from_fn(resolution, |x, y| {
        let phase = (x + 2 * y + 3 * n as u32) % 64;
        if phase < 32 {
            (phase * 6) as u8
        } else {
            ((63 - phase) * 6) as u8
        }
    })
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let resolution = Resolution {
        width: args.width,
        height: args.height,
    };

    let mut config = EncoderConfig {
        resolution,
        num_bframes: args.bframes,
        intra_period_max: args.intra_period,
        open_gop: args.open_gop,
        frame_threads: args.frame_threads,
        row_threads: args.row_threads,
        aec_thread: !args.inline_aec,
        num_slices: args.slices,
        ..Default::default()
    };

    if let Some(default_qp) = args.default_qp {
        config.base_qp = default_qp;
    }

    let backend = DummyBackend::new(config.base_qp);
    let mut encoder = Encoder::new(config, backend).expect("Unable to create encoder");

    let mut input = args
        .input
        .map(|input| File::open(input).expect("error opening input file"));
    let mut output = args.output.map(|output| File::create(output).unwrap());

    let mut digest = md5::Context::new();
    let mut frames = 0;
    let mut bytes = 0;

    let mut consume = |output_item: EncoderOutput| match output_item {
        EncoderOutput::Packet(packet) => {
            digest.consume(&packet.data);
            frames += 1;
            bytes += packet.data.len();
            if let Some(ref mut output) = output {
                output.write_all(&packet.data).unwrap();
            }
            true
        }
        EncoderOutput::EndOfStream => false,
    };

    let start = Instant::now();
    let mut buf = vec![0u8; resolution.get_area()];
    for i in 0..args.count {
        let picture = match input.as_mut() {
            Some(input) => {
                input.read_exact(&mut buf[..]).unwrap();
                Picture::new(resolution, buf.clone())
            }
            None => synthetic_picture(resolution, i),
        };

        encoder
            .submit_picture(picture, i as i64, i as i64)
            .unwrap();
        while let Some(item) = encoder
            .fetch_encoded_packet(BlockingMode::NonBlocking)
            .unwrap()
        {
            consume(item);
        }
    }

    encoder.flush().unwrap();
    while let Some(item) = encoder.fetch_encoded_packet(BlockingMode::Blocking).unwrap() {
        if !consume(item) {
            break;
        }
    }

    let elapsed = start.elapsed();
    let stats = encoder.pool_stats();
    drop(consume);

    println!(
        "{frames} frames, {bytes} bytes in {:.2}s ({} stale frames recycled)",
        elapsed.as_secs_f64(),
        stats.stale_recycled
    );
    println!("md5 {:x}", digest.compute());
}
