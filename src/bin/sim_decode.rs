//! Sim decode - runs a full decode session against the simulated device.
//!
//! Feeds synthetic access units through create, decode, flush and destroy
//! and prints every batch of frames that comes back. Useful for watching
//! the session's logging without decoder hardware.
//!
//! Usage:
//!   sim-decode [OPTIONS]
//!
//! Options:
//!   --frames <n>       Access units to submit (default: 30)
//!   --width <px>       Stream width reported by the device (default: 1280)
//!   --height <px>      Stream height reported by the device (default: 720)
//!   --codec <name>     h264 or h265 (default: h264)
//!   --latency <n>      Pictures the device holds back (default: 2)
//!
//! Examples:
//!   sim-decode
//!   RUST_LOG=mmapi_decoder=debug sim-decode --frames 5 --codec h265

use anyhow::{Context, Result};
use mmapi_decoder::sim::{SimConfig, SimDevice};
use mmapi_decoder::{Codec, DecodeSession, DecodedFrame, DecoderConfig};

/// Frame interval of a 30 fps stream, in microseconds.
const FRAME_INTERVAL_US: i64 = 33_333;

struct Args {
    frames: u32,
    width: u32,
    height: u32,
    codec: String,
    latency: usize,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        frames: 30,
        width: 1280,
        height: 720,
        codec: "h264".to_string(),
        latency: 2,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--frames" if i + 1 < args.len() => {
                result.frames = args[i + 1].parse().context("--frames expects a number")?;
                i += 2;
            }
            "--width" if i + 1 < args.len() => {
                result.width = args[i + 1].parse().context("--width expects a number")?;
                i += 2;
            }
            "--height" if i + 1 < args.len() => {
                result.height = args[i + 1].parse().context("--height expects a number")?;
                i += 2;
            }
            "--codec" if i + 1 < args.len() => {
                result.codec = args[i + 1].clone();
                i += 2;
            }
            "--latency" if i + 1 < args.len() => {
                result.latency = args[i + 1].parse().context("--latency expects a number")?;
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    Ok(result)
}

fn print_usage() {
    println!("Sim Decode - decode session against the simulated device");
    println!();
    println!("Usage: sim-decode [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --frames <n>       Access units to submit (default: 30)");
    println!("  --width <px>       Stream width reported by the device (default: 1280)");
    println!("  --height <px>      Stream height reported by the device (default: 720)");
    println!("  --codec <name>     h264 or h265 (default: h264)");
    println!("  --latency <n>      Pictures the device holds back (default: 2)");
}

/// A fake Annex B access unit: start code, NAL header, counter payload.
fn access_unit(n: u32) -> Vec<u8> {
    let mut au = vec![0, 0, 0, 1, if n == 0 { 0x67 } else { 0x41 }];
    au.extend(std::iter::repeat((n % 200) as u8).take(64));
    au
}

fn report(batch: &str, frames: &[DecodedFrame]) {
    for frame in frames {
        println!(
            "  {} frame #{:<4} pts {:>9} us  {}x{}  {} bytes",
            batch,
            frame.frame_index,
            frame.pts_us,
            frame.width,
            frame.height,
            frame.data.len()
        );
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mmapi_decoder=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = parse_args()?;
    let codec: Codec = args.codec.parse()?;

    println!();
    println!("========================================");
    println!("Sim Decode");
    println!("========================================");
    println!("Codec:   {}", codec);
    println!("Stream:  {}x{}", args.width, args.height);
    println!("Frames:  {}", args.frames);
    println!("Latency: {}", args.latency);
    println!("========================================");
    println!();

    let sim = SimConfig::default()
        .crop(args.width, args.height)
        .latency(args.latency);
    let stats = sim.stats_handle();
    let config = DecoderConfig::new(codec);

    let mut session = DecodeSession::create(config, |path, _| Ok(SimDevice::open(path, sim)))?;

    let mut decoded = 0;
    for n in 0..args.frames {
        let frames = session.decode(&access_unit(n), i64::from(n) * FRAME_INTERVAL_US)?;
        decoded += frames.len();
        report("decode", &frames);
    }

    let tail = session.flush()?;
    decoded += tail.len();
    report("flush ", &tail);

    session.destroy()?;

    let stats = stats.snapshot();
    println!();
    println!(
        "Decoded {} of {} frames ({} bitstream buffers, {} output polls)",
        decoded, args.frames, stats.inputs_enqueued, stats.output_dequeue_calls
    );
    if decoded != args.frames as usize {
        anyhow::bail!("decoded {} frames from {} access units", decoded, args.frames);
    }
    Ok(())
}
