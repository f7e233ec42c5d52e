//! taskweave - CLI

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::info;

use taskweave::runtime::lock::LockStats;
use taskweave::runtime::scheduler::{LocalContext, SchedulerStatsSnapshot};
use taskweave::util::config::{load_or_default, RuntimeConfig, StrategyKind};
use taskweave::util::logger::{self, LogLevel};
use taskweave::{AwaitError, LockManager, Promise, Scheduler, Step, TaskPriority, NAME, VERSION};

/// Cooperative task scheduling runtime
#[derive(Parser, Debug)]
#[command(name = "taskweave")]
#[command(author = "Taskweave Team")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./taskweave.toml when present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the built-in scenarios and print their results
    Demo,

    /// Hammer the lock manager with random multi-resource requests
    Stress {
        /// Deadlock-avoidance strategy (overrides the config file)
        #[arg(short, long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Concurrent requesters
        #[arg(short, long, default_value_t = 8)]
        requesters: usize,

        /// Registered resources
        #[arg(long, default_value_t = 16)]
        resources: u32,

        /// Requests per requester
        #[arg(short, long, default_value_t = 500)]
        trials: usize,

        /// Largest resource set per request
        #[arg(long, default_value_t = 4)]
        max_set: usize,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    Ordered,
    Backoff,
}

impl From<StrategyArg> for StrategyKind {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Ordered => StrategyKind::Ordered,
            StrategyArg::Backoff => StrategyKind::Backoff,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init_with_level(LogLevel::from_verbosity(args.verbose));

    let config = load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Commands::Demo => demo(&config)?,
        Commands::Stress {
            strategy,
            requesters,
            resources,
            trials,
            max_set,
        } => {
            let mut config = config;
            if let Some(strategy) = strategy {
                config.locks.strategy = strategy.into();
            }
            let report = stress(&config, requesters, resources, trials, max_set)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to encode report")?
            );
        }
        Commands::Config => {
            print!("{}", config.to_toml().context("Failed to encode configuration")?);
        }
    }

    Ok(())
}

fn scheduler_for(config: &RuntimeConfig) -> Result<Scheduler> {
    Scheduler::with_config(config.pool.clone()).context("Failed to start scheduler")
}

fn demo(config: &RuntimeConfig) -> Result<()> {
    let scheduler = scheduler_for(config)?;

    // Round trip.
    let answer = scheduler.schedule(|| 21 * 2)?.wait()?;
    println!("round trip: 21 * 2 = {}", answer);

    // Suspend on an externally completed promise; the worker serves others meanwhile.
    let promise = Promise::<u64>::new();
    let awaited = promise.future();
    let resumed = scheduler.schedule_with(TaskPriority::Normal, move |cx| {
        cx.await_on(&awaited, |value, _| Step::from(value.map(|v| v + 1)))
    })?;
    let meanwhile = scheduler.schedule(|| (1..=20u64).sum::<u64>())?.wait()?;
    promise.complete(99);
    println!(
        "suspend/resume: resumed with {} (ran {} meanwhile)",
        resumed.wait()?,
        meanwhile
    );

    // Ordered locks requested in opposite orders.
    let locks = LockManager::<&'static str>::from_config(&config.locks);
    locks.register("left")?;
    locks.register("right")?;
    let mut pairs = Vec::new();
    for keys in [["left", "right"], ["right", "left"]] {
        let locks = locks.clone();
        pairs.push(scheduler.schedule(move || -> usize {
            let mut held = 0;
            for _ in 0..100 {
                if let Ok(handle) = locks.acquire_all(&keys) {
                    held += handle.resources().len();
                }
            }
            held
        })?);
    }
    let held: usize = scheduler.when_all(pairs)?.wait()?.into_iter().sum();
    println!("locks: {} resource grants, {:?}", held, locks.stats());

    // Cancellation at a checkpoint.
    let spinning = scheduler.schedule_with(TaskPriority::Low, |cx| {
        let mut rounds = 0u64;
        loop {
            if let Err(canceled) = cx.checkpoint() {
                return Step::<u64>::from(canceled);
            }
            rounds += 1;
            if rounds > 1_000_000 {
                return Step::Ready(rounds);
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    })?;
    std::thread::sleep(Duration::from_millis(5));
    spinning.cancel();
    match spinning.wait() {
        Err(AwaitError::Canceled) => println!("cancellation: canceled"),
        other => bail!("cancellation demo ended unexpectedly: {:?}", other),
    }

    // Continuation delivered to a local context.
    let local = LocalContext::new();
    let target = local.target();
    let computed = scheduler.schedule(|| 6u64 * 7)?;
    let shown = scheduler.schedule_with(TaskPriority::Normal, move |cx| {
        cx.await_on_context(&computed, target, |value, _| Step::from(value))
    })?;
    println!("local context: {}", local.block_on(&shown)?);

    print_stats(scheduler.stats());
    scheduler.shutdown();
    Ok(())
}

fn print_stats(stats: SchedulerStatsSnapshot) {
    info!(
        scheduled = stats.tasks_scheduled,
        completed = stats.tasks_completed,
        faulted = stats.tasks_faulted,
        canceled = stats.tasks_canceled,
        suspensions = stats.suspensions,
        "scheduler stats"
    );
}

#[derive(Debug, Serialize)]
struct StressReport {
    strategy: &'static str,
    requesters: usize,
    resources: u32,
    trials: usize,
    elapsed_ms: u128,
    locks: LockStats,
}

fn stress(
    config: &RuntimeConfig,
    requesters: usize,
    resources: u32,
    trials: usize,
    max_set: usize,
) -> Result<StressReport> {
    if requesters == 0 || resources == 0 || max_set == 0 {
        bail!("requesters, resources and max-set must be positive");
    }

    let manager = LockManager::<u32>::from_config(&config.locks);
    for key in 0..resources {
        manager.register(key)?;
    }

    let mut pool = config.pool.clone();
    pool.min_workers = requesters;
    pool.max_workers = pool.max_workers.max(requesters);
    let scheduler = Scheduler::with_config(pool).context("Failed to start scheduler")?;

    let started = Instant::now();
    let max_set = max_set.min(resources as usize);
    let mut runs = Vec::with_capacity(requesters);
    for _ in 0..requesters {
        let manager = manager.clone();
        runs.push(scheduler.schedule_with(TaskPriority::Normal, move |_| {
            let mut rng = rand::rng();
            let mut keys: Vec<u32> = (0..resources).collect();
            for _ in 0..trials {
                keys.shuffle(&mut rng);
                let take = rng.random_range(1..=max_set);
                if let Err(err) = manager.acquire_all(&keys[..take]) {
                    return Step::fault(err);
                }
            }
            Step::Ready(())
        })?);
    }
    scheduler
        .when_all(runs)?
        .wait()
        .context("Stress run failed")?;
    let elapsed = started.elapsed();
    scheduler.shutdown();

    Ok(StressReport {
        strategy: manager.strategy().name(),
        requesters,
        resources,
        trials,
        elapsed_ms: elapsed.as_millis(),
        locks: manager.stats(),
    })
}
