//! Soak driver: runs a mixed pin/mtr/checkpoint workload against a pool and
//! reports the resulting statistics.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use mpool::{
    AdmissionSlot, FileHandle, FileOptions, LatchMode, PageHooks, PinFlags, Pool, PoolOptions,
    RegionSnapshot,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CRC_FILE_TYPE: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "mpool-soak",
    version,
    about = "Drive a buffer pool with a concurrent page workload"
)]
struct Cli {
    #[arg(long, value_name = "DIR", help = "Directory for the tablespace and log (default: a temporary directory)")]
    dir: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "TOML file with pool options")]
    config: Option<PathBuf>,

    #[arg(long, env = "MPOOL_SOAK_THREADS", default_value_t = 4, help = "Worker threads")]
    threads: usize,

    #[arg(long, env = "MPOOL_SOAK_PAGES", default_value_t = 256, help = "Pages in the tablespace")]
    pages: u32,

    #[arg(long, env = "MPOOL_SOAK_SECONDS", default_value_t = 5, help = "Run duration in seconds")]
    seconds: u64,

    #[arg(long, default_value_t = 30, help = "Share of operations that modify a page, in percent")]
    write_pct: u8,

    #[arg(long, default_value_t = 500, help = "Milliseconds between forced checkpoints, 0 disables")]
    checkpoint_ms: u64,

    #[arg(long, default_value_t = 0x5eed, help = "Seed of the first worker's RNG")]
    seed: u64,

    #[arg(long, help = "Checksum pages with CRC-32 on write and verify on read")]
    crc: bool,

    #[arg(long, help = "Keep the log in memory instead of a file")]
    memory_log: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text, help = "Report format")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn main() -> ExitCode {
    install_tracing_subscriber();
    let cli = Cli::parse();
    let scratch = match cli.dir.clone() {
        Some(dir) => match fs::create_dir_all(&dir) {
            Ok(()) => Workdir::Given(dir),
            Err(err) => {
                eprintln!("error: cannot create {}: {err}", dir.display());
                return ExitCode::from(2);
            }
        },
        None => match tempfile::tempdir() {
            Ok(tmp) => Workdir::Temp(tmp),
            Err(err) => {
                eprintln!("error: cannot create scratch directory: {err}");
                return ExitCode::from(2);
            }
        },
    };
    let pool = match open_pool(&cli, &scratch) {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("error: pool init failed: {err}");
            return ExitCode::from(2);
        }
    };
    match run(&cli, &scratch, pool) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

enum Workdir {
    Given(PathBuf),
    Temp(tempfile::TempDir),
}

impl Workdir {
    fn path(&self) -> PathBuf {
        match self {
            Workdir::Given(dir) => dir.clone(),
            Workdir::Temp(tmp) => tmp.path().to_path_buf(),
        }
    }
}

fn open_pool(cli: &Cli, dir: &Workdir) -> Result<Pool, Box<dyn Error>> {
    let mut opts = match &cli.config {
        Some(path) => {
            PoolOptions::from_toml_str(&fs::read_to_string(path)?)?.with_env_overrides()?
        }
        None => PoolOptions::from_env()?,
    };
    if !cli.memory_log && opts.log_path.is_none() {
        opts.log_path = Some(dir.path().join("mpool.log"));
    }
    let pool = Pool::open(opts)?;
    if cli.crc {
        pool.register_file_type(CRC_FILE_TYPE, PageHooks::crc32());
    }
    Ok(pool)
}

#[derive(Default)]
struct Tally {
    reads: AtomicU64,
    commits: AtomicU64,
    failures: AtomicU64,
}

fn run(cli: &Cli, dir: &Workdir, pool: Pool) -> Result<(), Box<dyn Error>> {
    let file = pool.open_file(
        dir.path().join("soak.db"),
        FileOptions {
            file_type: if cli.crc { CRC_FILE_TYPE } else { 0 },
            ..FileOptions::create()
        },
    )?;
    let deadline = Instant::now() + Duration::from_secs(cli.seconds);
    let stop = AtomicBool::new(false);
    let tally = Tally::default();
    info!(
        threads = cli.threads,
        pages = cli.pages,
        seconds = cli.seconds,
        write_pct = cli.write_pct,
        "soak.start"
    );

    thread::scope(|scope| {
        for idx in 0..cli.threads {
            let (pool, file, tally, stop) = (&pool, &file, &tally, &stop);
            let seed = cli.seed.wrapping_add(idx as u64);
            scope.spawn(move || worker(pool, file, cli, seed, tally, stop));
        }
        if cli.checkpoint_ms > 0 {
            let (pool, stop) = (&pool, &stop);
            scope.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(cli.checkpoint_ms));
                    if let Err(err) = pool.checkpoint(true) {
                        warn!(error = %err, "soak.checkpoint_failed");
                    }
                }
            });
        }
        while Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        stop.store(true, Ordering::Relaxed);
    });

    pool.verify()?;
    pool.checkpoint(true)?;
    let snapshot = pool.region_snapshot();
    drop(file);
    pool.close()?;
    report(cli, &tally, &snapshot)?;
    let failures = tally.failures.load(Ordering::Relaxed);
    if failures > 0 {
        return Err(format!("{failures} operations failed").into());
    }
    Ok(())
}

fn worker(pool: &Pool, file: &FileHandle, cli: &Cli, seed: u64, tally: &Tally, stop: &AtomicBool) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut slot = AdmissionSlot::default();
    let page_size = pool.page_size();
    let payload_end = if cli.crc { page_size - 4 } else { page_size };
    while !stop.load(Ordering::Relaxed) {
        if let Err(err) = pool.admission().enter(&mut slot, None) {
            warn!(error = %err, "soak.admission_failed");
            tally.failures.fetch_add(1, Ordering::Relaxed);
            break;
        }
        let page_no = rng.gen_range(0..cli.pages);
        let outcome = if rng.gen_range(0..100u8) < cli.write_pct {
            let offset = rng.gen_range(0..payload_end);
            let value: u8 = rng.gen();
            modify_page(pool, file, page_no, offset, value).map(|_| &tally.commits)
        } else {
            pool.pin(file, page_no, PinFlags::create())
                .map(|page| {
                    let _ = page.read()[0];
                })
                .map(|_| &tally.reads)
        };
        match outcome {
            Ok(counter) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(page = page_no, error = %err, "soak.op_failed");
                tally.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Err(err) = pool.admission().leave(&mut slot) {
            warn!(error = %err, "soak.admission_failed");
        }
    }
    pool.admission().release(&mut slot);
}

fn modify_page(pool: &Pool, file: &FileHandle, page_no: u32, offset: usize, value: u8) -> mpool::Result<()> {
    let mut mtr = pool.mtr();
    let slot = match mtr.get_page(file, page_no, LatchMode::Exclusive, PinFlags::create()) {
        Ok(slot) => slot,
        Err(err) => {
            mtr.abort();
            return Err(err);
        }
    };
    match mtr.modify(slot) {
        Ok(frame) => frame[offset] = value,
        Err(err) => {
            mtr.abort();
            return Err(err);
        }
    }
    let mut record = [0u8; 10];
    record[0] = 0x01;
    record[1..5].copy_from_slice(&page_no.to_be_bytes());
    record[5..9].copy_from_slice(&(offset as u32).to_be_bytes());
    record[9] = value;
    mtr.append_log(&record);
    mtr.commit().map(|_| ())
}

fn report(cli: &Cli, tally: &Tally, snapshot: &RegionSnapshot) -> Result<(), Box<dyn Error>> {
    match cli.format {
        OutputFormat::Json => {
            let doc = serde_json::json!({
                "reads": tally.reads.load(Ordering::Relaxed),
                "commits": tally.commits.load(Ordering::Relaxed),
                "failures": tally.failures.load(Ordering::Relaxed),
                "region": snapshot,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Text => {
            let stats = &snapshot.stats;
            println!("reads ............. {}", tally.reads.load(Ordering::Relaxed));
            println!("commits ........... {}", tally.commits.load(Ordering::Relaxed));
            println!("failures .......... {}", tally.failures.load(Ordering::Relaxed));
            println!("hits / misses ..... {} / {}", stats.hits, stats.misses);
            println!("evictions ......... {}", stats.evictions);
            println!("page writes ....... {}", stats.writes);
            println!("checkpoints ....... {}", stats.checkpoints);
            println!("last checkpoint ... {}", snapshot.last_ckp_lsn);
            println!("admission waits ... {}", stats.admission.waits);
        }
    }
    Ok(())
}
