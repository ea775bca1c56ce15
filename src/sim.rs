//! Demo, benchmark, and stress-test runners for the command queue.
//!
//! Producers submit commands and block; consumers poll `take`, simulate the
//! work, refresh the shared status record and `finish`. A monitor thread
//! scans for stalled claims while the run is in flight.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::QueueConfig;
use crate::consumer::Consumer;
use crate::error::QueueError;
use crate::queue::CommandQueue;
use crate::types::{ClaimId, CommandId, CommandKind, ConsumerId, StatusRecord, Telemetry};

// Demo timing knobs (small for quick CLI feedback).
const DEMO_STALL_TIMEOUT_MS: u64 = 150;
const DEMO_SLOW_HOLD_MS: u64 = 400;
const DEMO_POLL_MS: u64 = 10;
const DEMO_WORK_MS: u64 = 40;
// Benchmark stall timing (looser to reduce false positives).
const BENCH_STALL_TIMEOUT_MS: u64 = 200;
const BENCH_SLOW_HOLD_MS: u64 = 500;
// Interval between stall scans.
const MONITOR_POLL_MS: u64 = 25;

const CSV_HEADER: &str = "producers,commands_per_producer,consumers,total_commands,elapsed_ms,throughput_cmds_per_s,avg_submit_latency_us,cpu_user_s,cpu_sys_s,retired,duplicate_claims,stalled_consumers";

/// Errors that abort a simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} thread panicked")]
    Panicked(&'static str),
    #[error("{0} must be > 0")]
    InvalidParameter(&'static str),
}

pub type SimResult<T> = Result<T, SimError>;

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    // SAFETY: rusage is plain old data; getrusage fills it in.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

/// Stub on non-Unix platforms.
#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

fn spawn_named<T, F>(name: String, body: F) -> SimResult<thread::JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source| SimError::Spawn { name, source })
}

fn join<T>(handle: thread::JoinHandle<T>, what: &'static str) -> SimResult<T> {
    handle.join().map_err(|_| SimError::Panicked(what))
}

fn unix_seconds() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(0)
}

fn initial_status() -> StatusRecord {
    StatusRecord {
        name: "mesarthim".to_string(),
        time: unix_seconds(),
        uptime: 0,
        signal: -75,
        latency: 24,
        boost: false,
        telemetry: Telemetry {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 408_000,
            velocity: 7.66,
            inclination: 51.6,
            period: 92.7,
        },
    }
}

/// Apply the visible effect of a finished command to a status snapshot.
fn apply_command(status: &mut StatusRecord, kind: CommandKind, booted: Instant) {
    match kind {
        CommandKind::Ping => {}
        CommandKind::Reboot => status.boost = false,
        CommandKind::BoostEnable => status.boost = true,
        CommandKind::BoostDisable => status.boost = false,
    }
    status.signal = if status.boost { -70 } else { -75 };
    status.time = unix_seconds();
    status.uptime = if kind == CommandKind::Reboot {
        0
    } else {
        booted.elapsed().as_secs() as i32
    };
}

/// Parameters for one producer/consumer run.
#[derive(Clone, Debug)]
struct RunParams {
    producers: usize,
    commands_per_producer: usize,
    consumers: usize,
    work: Duration,
    validate: bool,
    simulate_stall: bool,
    slow_hold: Duration,
    config: QueueConfig,
}

/// State shared by all consumer threads of one run.
struct WorkerContext {
    stop: AtomicBool,
    // The first consumer to swap this holds its claim past the stall timeout.
    slow_pending: AtomicBool,
    slow_hold: Duration,
    work: Duration,
    poll: Duration,
    booted: Instant,
    seen_commands: Option<Mutex<HashSet<CommandId>>>,
    seen_claims: Option<Mutex<HashSet<ClaimId>>>,
    duplicate_claims: AtomicBool,
}

impl WorkerContext {
    fn record_claim(&self, command: CommandId, claim: ClaimId) -> SimResult<()> {
        if let Some(seen) = self.seen_commands.as_ref() {
            let mut guard = seen
                .lock()
                .map_err(|_| QueueError::LockPoisoned("seen commands"))?;
            // Each command must be claimed at most once.
            if !guard.insert(command) {
                self.duplicate_claims.store(true, Ordering::SeqCst);
            }
        }
        if let Some(seen) = self.seen_claims.as_ref() {
            let mut guard = seen
                .lock()
                .map_err(|_| QueueError::LockPoisoned("seen claims"))?;
            if !guard.insert(claim) {
                self.duplicate_claims.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Aggregated metrics from a single run.
struct RunReport {
    producers: usize,
    commands_per_producer: usize,
    consumers: usize,
    total_commands: usize,
    elapsed_ms: f64,
    throughput: f64,
    avg_submit_latency_us: f64,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    retired: u64,
    per_consumer: Vec<usize>,
    leftover: usize,
    duplicate_claims: bool,
    stalled: HashSet<ConsumerId>,
    final_status: Option<StatusRecord>,
}

fn consume(consumer: Consumer, ctx: Arc<WorkerContext>) -> SimResult<usize> {
    let queue = Arc::clone(consumer.queue());
    let mut retired = 0usize;
    loop {
        let claim = match consumer.take() {
            Ok(claim) => claim,
            Err(QueueError::Empty) => {
                if ctx.stop.load(Ordering::SeqCst) {
                    break;
                }
                consumer.heartbeat();
                thread::sleep(ctx.poll);
                continue;
            }
            Err(other) => return Err(other.into()),
        };
        ctx.record_claim(claim.command(), claim.id())?;
        debug!(
            "consumer {} working on command {} ({})",
            consumer.id(),
            claim.command(),
            claim.kind()
        );
        let mut work = ctx.work;
        if ctx.slow_pending.swap(false, Ordering::SeqCst) {
            info!(
                "consumer {} holds claim {} for {}ms",
                consumer.id(),
                claim.id(),
                ctx.slow_hold.as_millis()
            );
            work += ctx.slow_hold;
        }
        if !work.is_zero() {
            thread::sleep(work);
        }

        // Refresh the status on every command, then release the producer.
        let mut status = queue.read_status()?;
        apply_command(&mut status, claim.kind(), ctx.booted);
        queue.write_status(status)?;
        consumer.finish(&claim)?;
        retired += 1;
    }
    Ok(retired)
}

fn spawn_stall_monitor(
    queue: Arc<CommandQueue>,
    stop: Arc<AtomicBool>,
) -> SimResult<thread::JoinHandle<HashSet<ConsumerId>>> {
    spawn_named("stall-monitor".to_string(), move || {
        let mut stalled = HashSet::new();
        while !stop.load(Ordering::SeqCst) {
            for entry in queue.stalled_claims() {
                if stalled.insert(entry.consumer) {
                    warn!(
                        "consumer {} stalled on claim {} (command {}, idle {}ms, abandoned={})",
                        entry.consumer,
                        entry.claim.id(),
                        entry.claim.command(),
                        entry.idle.as_millis(),
                        entry.abandoned
                    );
                }
            }
            thread::sleep(Duration::from_millis(MONITOR_POLL_MS));
        }
        stalled
    })
}

fn run_once(params: &RunParams) -> SimResult<RunReport> {
    if params.producers == 0 {
        return Err(SimError::InvalidParameter("producers"));
    }
    if params.commands_per_producer == 0 {
        return Err(SimError::InvalidParameter("commands_per_producer"));
    }
    if params.consumers == 0 {
        return Err(SimError::InvalidParameter("consumers"));
    }

    let queue = Arc::new(CommandQueue::with_config(params.config.clone()));
    queue.write_status(initial_status())?;

    let ctx = Arc::new(WorkerContext {
        stop: AtomicBool::new(false),
        slow_pending: AtomicBool::new(params.simulate_stall),
        slow_hold: params.slow_hold,
        work: params.work,
        poll: params.config.poll_interval,
        booted: Instant::now(),
        seen_commands: params.validate.then(|| Mutex::new(HashSet::new())),
        seen_claims: params.validate.then(|| Mutex::new(HashSet::new())),
        duplicate_claims: AtomicBool::new(false),
    });
    let monitor_stop = Arc::new(AtomicBool::new(false));
    let monitor_thread = spawn_stall_monitor(Arc::clone(&queue), Arc::clone(&monitor_stop))?;

    let cpu_start = cpu_times_seconds();
    let start = Instant::now();

    let mut consumer_handles = Vec::new();
    for index in 0..params.consumers {
        let consumer = queue.open_consumer();
        let ctx = Arc::clone(&ctx);
        consumer_handles.push(spawn_named(format!("consumer-{index}"), move || {
            consume(consumer, ctx)
        })?);
    }

    // Total submit latency across all producers for averaging.
    let latency_us = Arc::new(AtomicU64::new(0));
    let mut producer_handles = Vec::new();
    for index in 0..params.producers {
        let queue = Arc::clone(&queue);
        let latency_us = Arc::clone(&latency_us);
        let commands = params.commands_per_producer;
        producer_handles.push(spawn_named(
            format!("producer-{index}"),
            move || -> SimResult<()> {
                for n in 0..commands {
                    let kind = CommandKind::ALL[(index + n) % CommandKind::ALL.len()];
                    let submitted = Instant::now();
                    queue.submit(kind)?;
                    latency_us.fetch_add(submitted.elapsed().as_micros() as u64, Ordering::SeqCst);
                }
                Ok(())
            },
        )?);
    }

    for handle in producer_handles {
        join(handle, "producer")??;
    }
    // Every submit returned, so every command has been retired.
    ctx.stop.store(true, Ordering::SeqCst);
    let mut per_consumer = Vec::with_capacity(params.consumers);
    for handle in consumer_handles {
        per_consumer.push(join(handle, "consumer")??);
    }
    monitor_stop.store(true, Ordering::SeqCst);
    let stalled = join(monitor_thread, "stall monitor")?;

    let total_commands = params.producers * params.commands_per_producer;
    let elapsed_ms = start.elapsed().as_millis() as f64;
    let throughput = if elapsed_ms > 0.0 {
        (total_commands as f64) / (elapsed_ms / 1000.0)
    } else {
        0.0
    };
    let avg_submit_latency_us = latency_us.load(Ordering::SeqCst) as f64 / total_commands as f64;
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    Ok(RunReport {
        producers: params.producers,
        commands_per_producer: params.commands_per_producer,
        consumers: params.consumers,
        total_commands,
        elapsed_ms,
        throughput,
        avg_submit_latency_us,
        cpu_user_s,
        cpu_sys_s,
        retired: queue.retired_total(),
        per_consumer,
        leftover: queue.len()?,
        duplicate_claims: ctx.duplicate_claims.load(Ordering::SeqCst),
        stalled,
        final_status: queue.read_status().ok(),
    })
}

/// Outcome of the contract-violation probes run before the demo.
struct ProbeReport {
    uninitialized_rejected: bool,
    invalid_kind_rejected: bool,
    rejected_finishes: usize,
}

/// Exercise every misuse path once on a private queue.
fn probe_contract() -> SimResult<ProbeReport> {
    let queue = Arc::new(CommandQueue::new());
    let uninitialized_rejected = queue.read_status() == Err(QueueError::Uninitialized);
    let invalid_kind_rejected = queue.submit_code(7) == Err(QueueError::InvalidKind(7));

    let pending = queue.enqueue(CommandKind::Ping)?;
    let owner = queue.open_consumer();
    let intruder = queue.open_consumer();
    let claim = owner.take()?;
    let mut rejected_finishes = 0;
    if matches!(
        intruder.finish(&claim),
        Err(QueueError::NoActiveClaim { .. })
    ) {
        rejected_finishes += 1;
    }
    owner.finish(&claim)?;
    if matches!(owner.finish(&claim), Err(QueueError::NoActiveClaim { .. })) {
        rejected_finishes += 1;
    }
    pending.wait()?;
    debug!("contract probes done, retired={}", queue.retired_total());

    Ok(ProbeReport {
        uninitialized_rejected,
        invalid_kind_rejected,
        rejected_finishes,
    })
}

/// Run the default demo: misuse probes, then producers and polling
/// consumers with one deliberately slow claim.
pub fn run_demo(base: &QueueConfig) -> SimResult<()> {
    info!("[DEMO] start");
    let probes = probe_contract()?;

    let params = RunParams {
        producers: 3,
        commands_per_producer: 3,
        consumers: 2,
        work: Duration::from_millis(DEMO_WORK_MS),
        validate: true,
        simulate_stall: true,
        slow_hold: Duration::from_millis(DEMO_SLOW_HOLD_MS),
        config: QueueConfig {
            stall_timeout: Duration::from_millis(DEMO_STALL_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEMO_POLL_MS),
            ..base.clone()
        },
    };
    let report = run_once(&params)?;
    info!("[DEMO] finished in {:.0}ms", report.elapsed_ms);

    let mut stalled: Vec<ConsumerId> = report.stalled.iter().copied().collect();
    stalled.sort_unstable();
    println!("DEMO SUMMARY");
    println!(
        "producers={} consumers={} commands_total={}",
        report.producers, report.consumers, report.total_commands
    );
    println!("retired_total={}", report.retired);
    println!("per_consumer_retired={:?}", report.per_consumer);
    println!("duplicate_claims={}", report.duplicate_claims);
    println!("rejected_finishes={}", probes.rejected_finishes);
    println!("invalid_kind_rejected={}", probes.invalid_kind_rejected);
    println!("uninitialized_rejected={}", probes.uninitialized_rejected);
    println!("leftover={}", report.leftover);
    println!("stalled_consumers={stalled:?}");
    if let Some(status) = report.final_status.as_ref() {
        println!("status_boost={}", status.boost);
    }
    Ok(())
}

/// Options shared by `bench` and `stress`.
#[derive(Clone, Debug)]
pub struct BenchOptions {
    pub work_ms: u64,
    pub poll_ms: u64,
    pub validate: bool,
    pub simulate_stall: bool,
}

fn bench_params(
    producers: usize,
    commands_per_producer: usize,
    consumers: usize,
    options: &BenchOptions,
    base: &QueueConfig,
) -> RunParams {
    let mut config = QueueConfig {
        poll_interval: Duration::from_millis(options.poll_ms.max(1)),
        ..base.clone()
    };
    if options.simulate_stall {
        config.stall_timeout = Duration::from_millis(BENCH_STALL_TIMEOUT_MS);
    }
    RunParams {
        producers,
        commands_per_producer,
        consumers,
        work: Duration::from_millis(options.work_ms),
        validate: options.validate,
        simulate_stall: options.simulate_stall,
        slow_hold: Duration::from_millis(BENCH_SLOW_HOLD_MS),
        config,
    }
}

fn print_row(report: &RunReport, validate: bool) {
    let cpu_user = report
        .cpu_user_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    let cpu_sys = report
        .cpu_sys_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    println!(
        "{},{},{},{},{:.2},{:.2},{:.2},{},{},{},{},{}",
        report.producers,
        report.commands_per_producer,
        report.consumers,
        report.total_commands,
        report.elapsed_ms,
        report.throughput,
        report.avg_submit_latency_us,
        cpu_user,
        cpu_sys,
        report.retired,
        report.duplicate_claims,
        report.stalled.len()
    );
    if report.leftover > 0 {
        eprintln!("# warning,leftover_commands,{}", report.leftover);
    }
    if validate {
        if report.duplicate_claims {
            eprintln!("# violation,duplicate_claims");
        }
        if report.retired != report.total_commands as u64 {
            eprintln!(
                "# violation,retired_mismatch,{},{}",
                report.retired, report.total_commands
            );
        }
    }
}

/// Run a single benchmark and print one CSV row.
pub fn run_benchmark(
    producers: usize,
    commands_per_producer: usize,
    consumers: usize,
    options: &BenchOptions,
    base: &QueueConfig,
) -> SimResult<()> {
    let params = bench_params(producers, commands_per_producer, consumers, options, base);
    let report = run_once(&params)?;
    println!("{CSV_HEADER}");
    print_row(&report, options.validate);
    Ok(())
}

/// Sweep multiple benchmark configurations and print CSV output.
pub fn run_stress(
    producer_sets: &[usize],
    command_sets: &[usize],
    consumer_sets: &[usize],
    options: &BenchOptions,
    base: &QueueConfig,
) -> SimResult<()> {
    for (name, set) in [
        ("producer_sets", producer_sets),
        ("command_sets", command_sets),
        ("consumer_sets", consumer_sets),
    ] {
        if set.is_empty() || set.contains(&0) {
            return Err(SimError::InvalidParameter(name));
        }
    }

    println!("{CSV_HEADER}");
    for &producers in producer_sets {
        for &commands in command_sets {
            for &consumers in consumer_sets {
                let params = bench_params(producers, commands, consumers, options, base);
                let report = run_once(&params)?;
                print_row(&report, options.validate);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_params(producers: usize, commands: usize, consumers: usize) -> RunParams {
        RunParams {
            producers,
            commands_per_producer: commands,
            consumers,
            work: Duration::ZERO,
            validate: true,
            simulate_stall: false,
            slow_hold: Duration::ZERO,
            config: QueueConfig {
                poll_interval: Duration::from_millis(1),
                ..QueueConfig::default()
            },
        }
    }

    #[test]
    fn every_command_is_retired_once() {
        let report = run_once(&quick_params(4, 10, 3)).expect("run");
        assert_eq!(report.retired, 40);
        assert_eq!(report.per_consumer.iter().sum::<usize>(), 40);
        assert_eq!(report.leftover, 0);
        assert!(!report.duplicate_claims);
        assert!(report.stalled.is_empty());
    }

    #[test]
    fn slow_claim_is_reported_as_stalled() {
        let mut params = quick_params(1, 2, 1);
        params.simulate_stall = true;
        params.slow_hold = Duration::from_millis(200);
        params.config.stall_timeout = Duration::from_millis(50);
        let report = run_once(&params).expect("run");
        assert_eq!(report.retired, 2);
        assert_eq!(report.stalled.len(), 1);
    }

    #[test]
    fn zero_sized_runs_are_rejected() {
        assert!(matches!(
            run_once(&quick_params(0, 1, 1)),
            Err(SimError::InvalidParameter("producers"))
        ));
        assert!(matches!(
            run_once(&quick_params(1, 1, 0)),
            Err(SimError::InvalidParameter("consumers"))
        ));
    }

    #[test]
    fn boost_commands_drive_the_status_flag() {
        let booted = Instant::now();
        let mut status = initial_status();
        apply_command(&mut status, CommandKind::BoostEnable, booted);
        assert!(status.boost);
        assert_eq!(status.signal, -70);
        apply_command(&mut status, CommandKind::Ping, booted);
        assert!(status.boost);
        apply_command(&mut status, CommandKind::Reboot, booted);
        assert!(!status.boost);
        assert_eq!(status.uptime, 0);
        assert_eq!(status.signal, -75);
    }

    #[test]
    fn contract_probes_reject_every_misuse() {
        let probes = probe_contract().expect("probes");
        assert!(probes.uninitialized_rejected);
        assert!(probes.invalid_kind_rejected);
        assert_eq!(probes.rejected_finishes, 2);
    }
}
