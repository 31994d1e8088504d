//! rtstream demo
//!
//! 在离线引擎上跑一个回环：写线程把正弦波写进 Sink "out1"，
//! 驱动线程按块时长调用回调，并把 "out1" 的输出送回 Source "in1"，
//! 读线程从 "in1" 阻塞读出，最后打印统计。

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use rtstream::{AudioEngine, Client, ClientConfig, OfflineEngine, Sink, Source};

/// rtstream demo - blocking streams over a real-time audio callback
#[derive(Parser)]
#[command(name = "rtstream-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Client name
    #[arg(short, long, default_value = "rtstream-demo")]
    name: String,

    /// Sample rate in Hz
    #[arg(short, long, default_value = "48000", value_parser = clap::value_parser!(u32).range(1..))]
    rate: u32,

    /// Frames per engine block
    #[arg(short, long, default_value = "256", value_parser = clap::value_parser!(u32).range(1..))]
    frames: u32,

    /// Seconds of audio to stream
    #[arg(short, long, default_value = "2.0")]
    seconds: f32,

    /// Tone frequency in Hz
    #[arg(long, default_value = "440.0")]
    tone: f32,

    /// Ring buffer size per port, in samples
    #[arg(long, default_value = "131072")]
    ring_samples: usize,

    /// Lock ring buffers in memory
    #[arg(long)]
    mlock: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let engine = OfflineEngine::new(cli.rate, cli.frames);
    let config = ClientConfig {
        ring_buffer_samples: cli.ring_samples,
        lock_memory: cli.mlock,
    };

    let mut client = Client::with_config(engine.clone(), &cli.name, config)?;
    let source = client.register_source("in1")?;
    let sink = client.register_sink("out1")?;
    client.activate()?;

    println!(
        "Client '{}' active: {} Hz, {} frames/block",
        client.name(),
        client.sample_rate(),
        client.buffer_size()
    );

    let total = (cli.seconds.max(0.0) * cli.rate as f32) as usize;

    let driver = {
        let engine = engine.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("demo-driver".into())
            .spawn(move || drive_loopback(&engine, &running))?
    };

    let writer = {
        let running = running.clone();
        let (rate, tone, frames) = (cli.rate, cli.tone, cli.frames as usize);
        thread::Builder::new()
            .name("demo-writer".into())
            .spawn(move || write_tone(sink, &running, total, rate, tone, frames))?
    };

    let reader = {
        let running = running.clone();
        let frames = cli.frames as usize;
        thread::Builder::new()
            .name("demo-reader".into())
            .spawn(move || read_peak(source, &running, total, frames))?
    };

    let start = Instant::now();
    let written = writer
        .join()
        .map_err(|_| anyhow::anyhow!("writer thread panicked"))?;
    let (read, peak) = reader
        .join()
        .map_err(|_| anyhow::anyhow!("reader thread panicked"))?;

    running.store(false, Ordering::SeqCst);
    let blocks = driver
        .join()
        .map_err(|_| anyhow::anyhow!("driver thread panicked"))?;

    client.deactivate()?;

    println!(
        "Streamed {} samples out, {} samples back in {:.2}s ({} blocks), peak {:.3}",
        written,
        read,
        start.elapsed().as_secs_f64(),
        blocks,
        peak
    );
    println!();
    print!("{}", client.stats());

    client.close()?;
    Ok(())
}

/// 按块时长驱动引擎，并把 out1 的输出回送到 in1
fn drive_loopback(engine: &OfflineEngine, running: &AtomicBool) -> u64 {
    let block = Duration::from_secs_f64(
        f64::from(engine.buffer_size()) / f64::from(engine.sample_rate()),
    );
    let mut next = Instant::now();
    let mut blocks = 0u64;

    while running.load(Ordering::SeqCst) {
        engine.run_cycle();
        let output = engine.take_output("out1");
        engine.queue_input("in1", &output);
        blocks += 1;

        next += block;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }
    }

    log::info!("Driver stopped after {} blocks", blocks);
    blocks
}

fn write_tone(
    mut sink: Sink,
    running: &AtomicBool,
    total: usize,
    rate: u32,
    tone: f32,
    chunk: usize,
) -> usize {
    let step = TAU * tone / rate as f32;
    let mut phase = 0.0f32;
    let mut buffer = vec![0.0f32; chunk.max(1)];
    let mut written = 0;

    while written < total && running.load(Ordering::SeqCst) {
        let len = buffer.len().min(total - written);
        for sample in buffer[..len].iter_mut() {
            *sample = 0.5 * phase.sin();
            phase = (phase + step) % TAU;
        }

        // 超时只返回部分写入，剩余部分继续写，保持相位连续
        let mut offset = 0;
        while offset < len && running.load(Ordering::SeqCst) {
            offset += sink.write_timeout(&buffer[offset..len], Duration::from_millis(100));
        }
        written += offset;
    }

    written
}

fn read_peak(mut source: Source, running: &AtomicBool, total: usize, chunk: usize) -> (usize, f32) {
    let mut buffer = vec![0.0f32; chunk.max(1)];
    let mut read = 0;
    let mut peak = 0.0f32;

    while read < total && running.load(Ordering::SeqCst) {
        let len = buffer.len().min(total - read);
        let n = source.read_timeout(&mut buffer[..len], Duration::from_millis(100));
        peak = buffer[..n].iter().fold(peak, |acc, s| acc.max(s.abs()));
        read += n;
    }

    (read, peak)
}
