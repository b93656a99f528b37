// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use slog::{info, o, Drain, Logger};

use vblk::block::{
    self, BlockDispatcher, FileResource, InMemoryDispatcher, OverlayOpts,
    QcowBlockDispatcher, RawBlockDispatcher, RawOpts,
    VolatileWriteBlockDispatcher, SECTOR_SIZE,
};
use vblk::hw::virtio::block::{
    BlockQueue, VIRTIO_BLK_MAX_REQ, VIRTIO_BLK_S_OK, VIRTIO_BLK_T_IN,
    VIRTIO_BLK_T_OUT,
};
use vblk::hw::virtio::testutil::TestVirtQueue;
use vblk::hw::virtio::QueueOpts;

/// Size of a virtio-blk request header
const REQ_HDR_LEN: usize = 16;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub main: Main,
    pub disk: Disk,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Main {
    #[serde(default = "default_guest_mem")]
    pub guest_mem: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: u16,
    pub requests: usize,
    #[serde(default = "default_io_size")]
    pub io_size: usize,
    #[serde(default)]
    pub workers: Workers,
    #[serde(default)]
    pub queue: QueueOpts,
}
fn default_guest_mem() -> u64 {
    1024 * 1024
}
fn default_queue_size() -> u16 {
    64
}
fn default_io_size() -> usize {
    4096
}

/// Concurrency model with which the queue is serviced
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Workers {
    /// A dedicated thread, blocking on the queue
    #[default]
    Thread,
    /// A task on the async runtime
    Async,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DiskOpts {
    pub max_transfer: Option<usize>,
    pub read_only: Option<bool>,
    /// Absorb writes into a volatile overlay
    pub overlay: Option<bool>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Disk {
    #[serde(rename = "type")]
    pub dtype: String,

    #[serde(flatten)]
    pub disk_opts: DiskOpts,

    #[serde(flatten, default)]
    pub options: BTreeMap<String, toml::Value>,
}

#[derive(Deserialize)]
struct FileConfig {
    path: String,
}

#[derive(Deserialize)]
struct MemConfig {
    size: usize,
}

// Try to turn unmatched flattened options into a config struct
fn opt_deser<'de, T: Deserialize<'de>>(
    value: &BTreeMap<String, toml::Value>,
) -> Result<T, anyhow::Error> {
    let map = toml::map::Map::from_iter(value.clone());
    let config = map.try_into::<T>()?;
    Ok(config)
}

/// Assemble the chain of dispatchers described by `disk`.
///
/// Returns the topmost dispatcher, and whether it accepts writes.
async fn build_disk(
    log: &Logger,
    disk: &Disk,
) -> Result<(Arc<dyn BlockDispatcher>, bool)> {
    let opts = &disk.disk_opts;
    let raw_opts = |read_only: Option<bool>| RawOpts {
        max_transfer: opts.max_transfer,
        read_only,
        skip_flush: None,
    };

    let (base, writable): (Box<dyn BlockDispatcher>, bool) =
        match &disk.dtype as &str {
            "file" => {
                let parsed: FileConfig = opt_deser(&disk.options)?;
                let file = FileResource::open(&parsed.path, raw_opts(opts.read_only))
                    .with_context(|| format!("opening {}", parsed.path))?;
                let writable = !file.is_read_only();
                (Box::new(RawBlockDispatcher::new(Box::new(file))), writable)
            }
            "mem" => {
                let parsed: MemConfig = opt_deser(&disk.options)?;
                let mem = InMemoryDispatcher::create(
                    vec![0u8; parsed.size],
                    SECTOR_SIZE,
                    opts.read_only.unwrap_or(false),
                )
                .context("creating in-memory disk")?;
                (Box::new(mem), !opts.read_only.unwrap_or(false))
            }
            "qcow" => {
                let parsed: FileConfig = opt_deser(&disk.options)?;
                let file = FileResource::open(&parsed.path, raw_opts(Some(true)))
                    .with_context(|| format!("opening {}", parsed.path))?;
                let raw = RawBlockDispatcher::new(Box::new(file));
                let qcow = QcowBlockDispatcher::open(Box::new(raw), log)
                    .await
                    .with_context(|| format!("loading qcow2 image {}", parsed.path))?;
                (Box::new(qcow), false)
            }
            other => bail!("unrecognized disk type {other}"),
        };

    if opts.overlay.unwrap_or(false) {
        let overlay_opts = OverlayOpts {
            max_transfer: opts.max_transfer.unwrap_or(block::MAX_BUF),
            ..Default::default()
        };
        let overlay = VolatileWriteBlockDispatcher::new(base, overlay_opts, log)
            .context("creating volatile overlay")?;
        Ok((Arc::new(overlay), true))
    } else {
        Ok((Arc::from(base), writable))
    }
}

fn build_log(level: slog::Level) -> slog::Logger {
    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::CompactFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("vblk-bench", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let (dtrace_drain, probe_reg) = slog_dtrace::Dtrace::new();

    let filtered_main = slog::LevelFilter::new(main_drain, level);

    let log = slog::Logger::root(
        slog::Duplicate::new(filtered_main.fuse(), dtrace_drain.fuse()).fuse(),
        o!(),
    );

    if let slog_dtrace::ProbeRegistration::Failed(err) = probe_reg {
        slog::error!(&log, "Error registering slog-dtrace probes: {:?}", err);
    }

    log
}

pub fn config_parse(path: &str) -> anyhow::Result<Config> {
    let file_data =
        std::fs::read(path).context("Failed to read given config.toml")?;

    Ok(toml::from_str::<Config>(
        std::str::from_utf8(&file_data)
            .context("config should be valid utf-8")?,
    )?)
}

#[derive(clap::Parser)]
struct Args {
    #[clap(value_name = "config", action)]
    config: String,

    /// Override the worker model from the config
    #[clap(long, action)]
    workers: Option<Workers>,

    /// Log at debug level
    #[clap(short, long, action)]
    verbose: bool,
}

struct Timer {
    log: Logger,
    count: usize,
    time: Instant,
}

impl Timer {
    fn new(log: &Logger) -> Self {
        Self { log: log.clone(), count: 0, time: Instant::now() }
    }

    fn tick(&mut self, n: usize) {
        self.count += n;

        let now = Instant::now();

        if (now - self.time) >= Duration::from_secs(5) {
            info!(self.log, "{} requests/second", self.count / 5);
            self.count = 0;
            self.time = now;
        }
    }
}

fn req_header(rtype: u32, sector: u64) -> [u8; REQ_HDR_LEN] {
    let mut hdr = [0u8; REQ_HDR_LEN];
    hdr[0..4].copy_from_slice(&rtype.to_le_bytes());
    hdr[8..16].copy_from_slice(&sector.to_le_bytes());
    hdr
}

/// Play the part of the guest driver: publish batches of random requests,
/// wait for the device to return them, and check their status.
fn drive(
    tvq: &mut TestVirtQueue,
    main: &Main,
    capacity: u64,
    writable: bool,
    device_alive: &dyn Fn() -> bool,
    log: &Logger,
) -> Result<usize> {
    let mut rng = rand::thread_rng();
    let io_sectors = (main.io_size / SECTOR_SIZE) as u64;
    // Each request consumes three descriptors
    let batch = usize::from(main.queue_size / 3).max(1);
    let mut timer = Timer::new(log);

    let mut done = 0;
    while done < main.requests {
        let count = usize::min(batch, main.requests - done);
        let mut statuses = Vec::with_capacity(count);
        for _ in 0..count {
            let sector = rng.gen_range(0..=capacity - io_sectors);
            let write = writable && rng.gen_bool(0.5);

            let rtype = if write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN };
            let hdr = tvq.add_readable(&req_header(rtype, sector));
            let data = if write {
                let mut buf = vec![0u8; main.io_size];
                rng.fill(&mut buf[..]);
                tvq.add_readable(&buf)
            } else {
                tvq.add_writable(main.io_size as u32)
            };
            let status = tvq.add_writable(1);
            tvq.chain_descriptors(&[hdr, data, status]);
            tvq.publish_avail(hdr);
            statuses.push(status);
        }
        tvq.kick();

        let mut completed = 0;
        while completed < count {
            let used = tvq.drain_used();
            if used.is_empty() {
                if !device_alive() {
                    bail!("device stopped with {} requests outstanding", count - completed);
                }
                std::thread::yield_now();
                continue;
            }
            completed += used.len();
            timer.tick(used.len());
        }

        for status in statuses {
            let res = tvq.read_guest_mem(tvq.desc_addr(status), 1)[0];
            if res != VIRTIO_BLK_S_OK {
                bail!("request failed with status {res}");
            }
        }
        tvq.recycle();
        done += count;
    }
    Ok(done)
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args { config, workers, verbose } = Args::parse();

    let log = build_log(if verbose { slog::Level::Debug } else { slog::Level::Info });

    let config = config_parse(&config)?;
    let main = Main { workers: workers.unwrap_or(config.main.workers), ..config.main };

    if main.io_size == 0 || main.io_size % SECTOR_SIZE != 0 {
        bail!("io_size must be a non-zero multiple of {SECTOR_SIZE}");
    }
    if main.io_size > VIRTIO_BLK_MAX_REQ {
        bail!("io_size may not exceed {VIRTIO_BLK_MAX_REQ}");
    }
    if main.queue_size < 3 {
        bail!("queue_size must fit at least one request");
    }
    let batch = u64::from(main.queue_size / 3);
    let needed = batch * (REQ_HDR_LEN + main.io_size + 1) as u64;
    if main.guest_mem < needed {
        bail!("guest_mem must be at least {needed} bytes for this queue and io size");
    }

    let (disk, writable) = build_disk(&log, &config.disk).await?;
    let bq = BlockQueue::new(disk, "vblk-bench", &log);
    let capacity = bq.capacity();
    if capacity < (main.io_size / SECTOR_SIZE) as u64 {
        bail!("disk of {capacity} sectors too small for io_size");
    }

    let mut tvq = TestVirtQueue::with_data_area(main.queue_size, main.guest_mem, main.queue);
    info!(log, "starting";
        "workers" => %main.workers,
        "requests" => main.requests,
        "io_size" => main.io_size,
        "capacity" => capacity,
        "writes" => writable,
    );

    let start = Instant::now();
    let served = match main.workers {
        Workers::Thread => {
            let worker = bq
                .poll(tvq.vq(), tokio::runtime::Handle::current())
                .context("spawning queue worker")?;
            let res = tokio::task::block_in_place(|| {
                drive(&mut tvq, &main, capacity, writable, &|| !worker.is_finished(), &log)
            });
            tvq.vq().halt();
            let worker_res = worker
                .join()
                .map_err(|_| anyhow::anyhow!("queue worker panicked"))?;
            worker_res.context("queue worker failed")?;
            res?
        }
        Workers::Async => {
            let task = {
                let bq = Arc::clone(&bq);
                let vq = Arc::clone(tvq.vq());
                tokio::spawn(async move { bq.poll_async(vq).await })
            };
            let res = tokio::task::block_in_place(|| {
                drive(&mut tvq, &main, capacity, writable, &|| !task.is_finished(), &log)
            });
            tvq.vq().halt();
            task.await.context("queue task panicked")?.context("queue task failed")?;
            res?
        }
    };

    let elapsed = start.elapsed();
    info!(log, "done";
        "requests" => served,
        "elapsed_ms" => elapsed.as_millis() as u64,
        "requests_per_sec" => (served as f64 / elapsed.as_secs_f64()) as u64,
    );
    Ok(())
}
