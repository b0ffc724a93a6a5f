mod demo;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tessera_alloc::Allocator;
use tessera_render::{Device, HeadlessDevice, PoolKind, RenderConfig, Renderer};
use tessera_render_wgpu::WgpuDevice;
use tracing_subscriber::EnvFilter;

use crate::demo::Demo;

#[derive(Parser)]
#[command(name = "tessera-cli", about = "CLI tool for the tessera rendering core")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Render synthetic frames and report per-frame statistics
    Frame(FrameArgs),
    /// Stress the range allocator with a seeded allocate/free mix
    Alloc {
        /// Address space size in bytes
        #[arg(short, long, default_value = "1048576")]
        capacity: u32,
        /// Allocator node table size
        #[arg(long, default_value = "4096")]
        max_allocs: u32,
        /// Number of operations
        #[arg(short, long, default_value = "10000")]
        ops: usize,
        /// Largest single request in bytes
        #[arg(long, default_value = "4096")]
        max_size: u32,
        /// Seed for the operation mix
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
}

#[derive(Args)]
struct FrameArgs {
    /// Number of frames to render
    #[arg(short, long, default_value = "3")]
    frames: u64,
    /// Cubes drawn per frame
    #[arg(short, long, default_value = "64")]
    draws: usize,
    /// Distinct materials the cubes cycle through
    #[arg(short, long, default_value = "4")]
    materials: usize,
    /// Render target width
    #[arg(long, default_value = "256")]
    width: u32,
    /// Render target height
    #[arg(long, default_value = "256")]
    height: u32,
    /// JSON render configuration; defaults apply to missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Submit to a real GPU adapter instead of the recording device
    #[arg(long)]
    gpu: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("tessera-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", tessera_common::crate_info());
            println!("alloc: {}", tessera_alloc::crate_info());
            println!("render: {}", tessera_render::crate_info());
            println!("render-wgpu: {}", tessera_render_wgpu::crate_info());
        }
        Commands::Frame(args) => {
            let config = match &args.config {
                Some(path) => RenderConfig::load(path)?,
                None => RenderConfig::default(),
            };
            if args.gpu {
                let renderer = run_frames(WgpuDevice::headless()?, config, &args)?;
                renderer.device().wait_idle();
                println!("gpu: submitted={}", renderer.device().submitted());
            } else {
                let renderer = run_frames(HeadlessDevice::new(), config, &args)?;
                let device = renderer.device();
                println!(
                    "headless: calls={}, frames={}, bytes_written={}",
                    device.calls(),
                    device.frames().len(),
                    device.bytes_written()
                );
            }
        }
        Commands::Alloc {
            capacity,
            max_allocs,
            ops,
            max_size,
            seed,
        } => stress_allocator(capacity, max_allocs, ops, max_size.max(1), seed)?,
    }

    Ok(())
}

fn run_frames<D: Device>(
    device: D,
    config: RenderConfig,
    args: &FrameArgs,
) -> anyhow::Result<Renderer<D>> {
    let mut renderer = Renderer::new(device, config)?;
    let mut demo = Demo::new(
        renderer.new_scene(),
        args.width,
        args.height,
        args.draws,
        args.materials,
    );
    println!(
        "Rendering {} frames: draws={}, materials={}",
        args.frames, args.draws, args.materials
    );

    for frame in 0..args.frames {
        let items = demo.frame(frame);
        let stats = renderer.render(&mut demo.scene, &demo.pass, &items)?;
        println!(
            "frame {}: draws={}, pipelines={}, sets={}, words={}, dynamic={}B, key_bits={}, commits={}, {:?}",
            stats.frame,
            stats.draws,
            stats.pipeline_binds,
            stats.bind_group_binds,
            stats.stream_words,
            stats.dynamic_bytes,
            stats.key_bits,
            stats.commit_writes,
            stats.elapsed
        );
    }

    let cache = renderer.cache();
    let stats = cache.stats();
    println!(
        "cache: pipelines={} (compiled={}, hits={}), layouts={}, samplers={}, shaders={}, sets={}",
        cache.pipeline_count(),
        stats.pipelines_compiled,
        stats.pipeline_hits,
        cache.layout_count(),
        cache.sampler_count(),
        cache.shader_count(),
        stats.binding_sets_created
    );
    for kind in [
        PoolKind::Uniform,
        PoolKind::Attribute,
        PoolKind::Vertex,
        PoolKind::Index,
    ] {
        let pool = cache.pool_stats(kind);
        println!(
            "pool {}: buffers={}, heaps={}, used={}/{}",
            kind.name(),
            pool.buffers,
            pool.heaps,
            pool.used,
            pool.capacity
        );
    }
    Ok(renderer)
}

fn stress_allocator(
    capacity: u32,
    max_allocs: u32,
    ops: usize,
    max_size: u32,
    seed: u64,
) -> anyhow::Result<()> {
    let mut allocator = Allocator::new(capacity, max_allocs);
    let mut live = Vec::new();
    let mut state = seed.max(1);
    let mut failed = 0usize;

    for _ in 0..ops {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        if live.is_empty() || state % 3 != 0 {
            let size = 1 + ((state >> 16) as u32) % max_size;
            match allocator.allocate(size) {
                Some(allocation) => live.push(allocation),
                None => failed += 1,
            }
        } else {
            let victim = ((state >> 8) as usize) % live.len();
            allocator.free(live.swap_remove(victim))?;
        }
    }

    let report = allocator.storage_report();
    println!(
        "alloc: ops={ops}, live={}, failed={failed}, regions={}",
        live.len(),
        allocator.regions().len()
    );
    println!(
        "free: total={}, largest={}",
        report.total_free_space, report.largest_free_region
    );
    Ok(())
}
