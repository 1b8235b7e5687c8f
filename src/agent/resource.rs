//! CPU, RAM and disk burners.
//!
//! Every burner returns as soon as its workers are launched. Each worker is a
//! separate `havoc-agent worker ...` process that owns its deadline, so memory
//! pressure and descriptor exhaustion land on the worker and not on the agent.

use std::ffi::OsString;
use std::hint::black_box;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use clap::Subcommand;
use rand::{Rng, RngCore};
use sysinfo::System;
use uuid::Uuid;

use havoc::protocol::OperationResult;

use crate::error::{CommandError, CommandResult};

/// Default run time of every burner, in seconds.
pub const DEFAULT_BURN_SECS: f64 = 30.0;

pub const DEFAULT_FILE_SIZE: &str = "1k";
pub const DEFAULT_THREAD_LIMIT: &str = "200";

/// Hidden agent subcommand that runs one [`WorkerJob`].
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Stop topping up RAM once the host is this full.
const RAM_CEILING_PERCENT: f64 = 90.0;

/// Each top-up grabs this share of the memory still free.
const RAM_STEP_PERCENT: u64 = 10;

const RAM_POLL: Duration = Duration::from_millis(200);

/// Prefix shared by every file a disk burn writes.
const DISK_FILE_PREFIX: &str = "havoc-burn-";

/// One burn worker, run to completion inside its own process.
#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum WorkerJob {
    /// Spin one core
    Cpu {
        #[arg(long)]
        secs: f64,
    },

    /// Hold as much memory as the host hands out
    Ram {
        #[arg(long)]
        secs: f64,
    },

    /// Rewrite files from a pool of threads
    Disk {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        worker: usize,
        #[arg(long)]
        file_size: u64,
        #[arg(long)]
        thread_limit: usize,
        #[arg(long)]
        secs: f64,
    },
}

impl WorkerJob {
    /// Command line that makes an agent executable run this job.
    pub fn to_args(&self) -> Vec<OsString> {
        let (kind, flags): (&str, Vec<(&str, OsString)>) = match self {
            Self::Cpu { secs } => ("cpu", vec![("--secs", secs.to_string().into())]),
            Self::Ram { secs } => ("ram", vec![("--secs", secs.to_string().into())]),
            Self::Disk {
                dir,
                run_id,
                worker,
                file_size,
                thread_limit,
                secs,
            } => (
                "disk",
                vec![
                    ("--dir", dir.clone().into_os_string()),
                    ("--run-id", run_id.into()),
                    ("--worker", worker.to_string().into()),
                    ("--file-size", file_size.to_string().into()),
                    ("--thread-limit", thread_limit.to_string().into()),
                    ("--secs", secs.to_string().into()),
                ],
            ),
        };

        let mut args = vec![OsString::from(WORKER_SUBCOMMAND), OsString::from(kind)];
        for (flag, value) in flags {
            args.push(OsString::from(flag));
            args.push(value);
        }
        args
    }

    /// Run in the current process until the deadline passes.
    pub fn run(self) {
        match self {
            Self::Cpu { secs } => cpu_worker(deadline_after(secs)),
            Self::Ram { secs } => ram_worker(deadline_after(secs)),
            Self::Disk {
                dir,
                run_id,
                worker,
                file_size,
                thread_limit,
                secs,
            } => {
                let disk = DiskWorker::new(dir, run_id, worker, file_size, thread_limit, secs);
                run_disk_worker(&disk);
            }
        }
    }
}

fn deadline_after(secs: f64) -> Instant {
    Instant::now() + Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

/// Starts burn workers by re-running an agent executable.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    log_level: Option<String>,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            log_level: None,
        }
    }

    /// Launcher that re-runs the executable of this process.
    pub fn current() -> Self {
        Self::new(std::env::current_exe().unwrap_or_else(|_| PathBuf::from("havoc-agent")))
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.log_level = Some(level.to_string());
        self
    }

    /// Start `job` in a child process and reap it in the background.
    pub fn launch(&self, job: &WorkerJob) -> CommandResult<u32> {
        let mut command = Command::new(&self.program);
        command
            .args(job.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        if let Some(level) = &self.log_level {
            command.env("HAVOC_LOG_LEVEL", level);
        }

        let mut child = command
            .spawn()
            .map_err(|e| CommandError::Unexpected(format!("Failed to start worker: {}", e)))?;
        let pid = child.id();

        thread::Builder::new()
            .name(format!("havoc-reap-{}", pid))
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => tracing::debug!("Worker {} finished", pid),
                Ok(status) => tracing::warn!("Worker {} exited with {}", pid, status),
                Err(e) => tracing::warn!("Failed to wait for worker {}: {}", pid, e),
            })
            .map_err(|e| CommandError::Unexpected(format!("Failed to watch worker: {}", e)))?;

        Ok(pid)
    }
}

pub fn burn_cpu(workers: &WorkerLauncher, timeout: Duration) -> CommandResult<OperationResult> {
    let cores = num_cores();
    let job = WorkerJob::Cpu {
        secs: timeout.as_secs_f64(),
    };
    for _ in 0..cores {
        workers.launch(&job)?;
    }

    tracing::info!("Burning {} cores for {:?}", cores, timeout);
    Ok(OperationResult::success("CPU burning started"))
}

fn cpu_worker(deadline: Instant) {
    let mut rng = rand::thread_rng();
    while Instant::now() < deadline {
        for _ in 0..10_000 {
            let n: u32 = rng.gen_range(1..999_999);
            black_box((n as f64).sqrt());
        }
    }
}

pub fn burn_ram(workers: &WorkerLauncher, timeout: Duration) -> CommandResult<OperationResult> {
    let pid = workers.launch(&WorkerJob::Ram {
        secs: timeout.as_secs_f64(),
    })?;

    tracing::info!("Overflowing RAM for {:?} in worker {}", timeout, pid);
    Ok(OperationResult::success("RAM overflowing has been started"))
}

fn ram_worker(deadline: Instant) {
    prefer_as_oom_victim();

    let mut sys = System::new();
    sys.refresh_memory();

    let mut held: Vec<Vec<u8>> = Vec::new();
    if let Some(buf) = allocate_share(sys.available_memory(), 100) {
        held.push(buf);
    }

    while Instant::now() < deadline {
        sys.refresh_memory();
        if memory_used_percent(&sys) < RAM_CEILING_PERCENT {
            let step = sys.available_memory() / 100 * RAM_STEP_PERCENT;
            match try_allocate(step) {
                Some(buf) => held.push(buf),
                // Out of memory: drop the top-ups, keep the base block
                None => held.truncate(1),
            }
        }
        thread::sleep(RAM_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }

    let total: usize = held.iter().map(Vec::len).sum();
    drop(held);
    tracing::info!("RAM burn finished, released {} bytes", total);
}

/// Under memory pressure the kernel should pick this worker, not the agent.
#[cfg(target_os = "linux")]
fn prefer_as_oom_victim() {
    if let Err(e) = std::fs::write("/proc/self/oom_score_adj", "1000") {
        tracing::debug!("Could not raise OOM score: {}", e);
    }
}

#[cfg(not(target_os = "linux"))]
fn prefer_as_oom_victim() {}

/// Allocate `ratio`% of `free` bytes, stepping the ratio down one point at a
/// time until an allocation succeeds.
fn allocate_share(free: u64, ratio: u64) -> Option<Vec<u8>> {
    (1..=ratio.min(100))
        .rev()
        .find_map(|r| try_allocate(free / 100 * r))
}

/// Allocation that reports failure instead of aborting the process. Pages are
/// written so the memory is really committed.
fn try_allocate(size: u64) -> Option<Vec<u8>> {
    let size = usize::try_from(size).ok()?;
    let mut buf: Vec<u8> = Vec::new();
    buf.try_reserve_exact(size).ok()?;
    buf.resize(size, b' ');
    Some(buf)
}

fn memory_used_percent(sys: &System) -> f64 {
    let total = sys.total_memory();
    if total == 0 {
        return 100.0;
    }
    sys.used_memory() as f64 * 100.0 / total as f64
}

/// Parse `<digits><B|K|M>` (case-insensitive). Bare digits are bytes.
pub fn parse_file_size(raw: &str) -> CommandResult<u64> {
    let raw = raw.trim();
    let bad = || {
        CommandError::invalid(format!(
            "Wrong format of file_size param \"{}\". \"file_size\" parameter should have the \
             following format: \"<size_in_digit><Multiplier>\". Correct values for multiplier \
             are - B K M b k m",
            raw
        ))
    };

    let (count, shift) = match raw.chars().last() {
        Some(c) if c.is_ascii_digit() => (raw, 0),
        Some(c) => {
            let shift = match c.to_ascii_uppercase() {
                'B' => 0,
                'K' => 10,
                'M' => 20,
                _ => return Err(bad()),
            };
            (&raw[..raw.len() - c.len_utf8()], shift)
        }
        None => return Err(bad()),
    };

    if count.is_empty() || !count.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let count: u64 = count.parse().map_err(|_| bad())?;
    count.checked_shl(shift).filter(|v| v >> shift == count).ok_or_else(bad)
}

pub fn parse_thread_limit(raw: &str) -> CommandResult<usize> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(CommandError::invalid(
            "Thread limit parameter should have the following format: \"<count_in_digit>\"",
        ));
    }
    raw.parse()
        .map_err(|_| CommandError::invalid(format!("Thread limit {} is too large", raw)))
}

/// One disk worker process: its threads, its files, its deadline.
#[derive(Debug, Clone)]
pub struct DiskWorker {
    pub dir: PathBuf,
    pub run_id: String,
    pub worker: usize,
    pub file_size: u64,
    pub threads: usize,
    pub deadline: Instant,
}

impl DiskWorker {
    /// The thread count follows this process's own descriptor limit.
    pub fn new(
        dir: PathBuf,
        run_id: String,
        worker: usize,
        file_size: u64,
        thread_limit: usize,
        secs: f64,
    ) -> Self {
        Self {
            dir,
            run_id,
            worker,
            file_size,
            threads: threads_per_worker(thread_limit, open_file_limit(), num_cores()),
            deadline: deadline_after(secs),
        }
    }

    /// Prefix of every file this worker writes.
    fn prefix(&self) -> String {
        format!("{}{}-{}-", DISK_FILE_PREFIX, self.run_id, self.worker)
    }

    fn file_path(&self, thread: usize) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix(), thread))
    }
}

/// `min(thread_limit, open_files / cores)`, never below one.
pub fn threads_per_worker(thread_limit: usize, open_files: u64, cores: usize) -> usize {
    let per_core = usize::try_from(open_files).unwrap_or(usize::MAX) / cores.max(1);
    thread_limit.min(per_core).max(1)
}

pub fn burn_disk(
    workers: &WorkerLauncher,
    timeout: Duration,
    file_size: &str,
    thread_limit: &str,
) -> CommandResult<OperationResult> {
    let file_size = parse_file_size(file_size)?;
    let thread_limit = parse_thread_limit(thread_limit)?;
    let dir = std::env::temp_dir();
    let run_id = Uuid::new_v4().simple().to_string();
    let cores = num_cores();

    tracing::info!(
        "Burning disk in {} with {} workers, up to {} threads each, {} byte files, run {}",
        dir.display(),
        cores,
        thread_limit,
        file_size,
        run_id
    );
    for worker in 0..cores {
        workers.launch(&WorkerJob::Disk {
            dir: dir.clone(),
            run_id: run_id.clone(),
            worker,
            file_size,
            thread_limit,
            secs: timeout.as_secs_f64(),
        })?;
    }

    Ok(OperationResult::success("HDD burning has been started"))
}

/// Write until the deadline, join every writer, then delete every file this
/// worker created.
pub fn run_disk_worker(disk: &DiskWorker) {
    thread::scope(|scope| {
        for t in 0..disk.threads {
            let path = disk.file_path(t);
            let spawned = thread::Builder::new()
                .name(format!("havoc-disk-{}", t))
                .spawn_scoped(scope, move || disk_writer(&path, disk.file_size, disk.deadline));
            if let Err(e) = spawned {
                // Out of threads is expected at high limits
                tracing::debug!("Disk writer {} not started: {}", t, e);
            }
        }
    });

    let removed = remove_run_files(&disk.dir, &disk.prefix());
    tracing::info!(
        "Disk worker {} of run {} finished, removed {} files",
        disk.worker,
        disk.run_id,
        removed
    );
}

fn disk_writer(path: &Path, size: u64, deadline: Instant) {
    let mut rng = rand::thread_rng();
    let mut chunk = vec![0u8; 64 * 1024];

    while Instant::now() < deadline {
        // Write errors (full disk, no descriptors) are expected; keep going
        if let Err(e) = write_random_file(path, size, &mut rng, &mut chunk) {
            tracing::trace!("Disk write to {} failed: {}", path.display(), e);
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn write_random_file(
    path: &Path,
    size: u64,
    rng: &mut impl RngCore,
    chunk: &mut [u8],
) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    let mut left = size;
    while left > 0 {
        let n = chunk.len().min(usize::try_from(left).unwrap_or(chunk.len()));
        rng.fill_bytes(&mut chunk[..n]);
        file.write_all(&chunk[..n])?;
        left -= n as u64;
    }
    file.flush()
}

fn remove_run_files(dir: &Path, prefix: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
        .filter(|e| match std::fs::remove_file(e.path()) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("Failed to remove {}: {}", e.path().display(), err);
                false
            }
        })
        .count()
}

#[cfg(unix)]
fn open_file_limit() -> u64 {
    use nix::sys::resource::{getrlimit, Resource};

    getrlimit(Resource::RLIMIT_NOFILE)
        .map(|(soft, _)| soft)
        .unwrap_or(1024)
}

#[cfg(not(unix))]
fn open_file_limit() -> u64 {
    16_000
}

fn num_cores() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
