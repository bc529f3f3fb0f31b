//! rangelock stress driver
//!
//! Runs random READ/WRITE range-lock transactions from many threads
//! against one manager and reports how they ended.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam::channel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rangelock::{
    get_range_lock, Comparator, Key, LockError, LockMode, LockPolicy, LocktreeManager,
    ManagerConfig, Transaction, TxnRegistry,
};
use tracing_subscriber::{fmt, EnvFilter};

/// rangelock stress test
#[derive(Parser, Debug)]
#[command(name = "rangelock-stress")]
#[command(about = "Concurrent range-lock workload against one lock manager")]
#[command(version)]
struct Args {
    /// Worker threads
    #[arg(short, long, default_value = "8")]
    threads: usize,

    /// Transactions per worker
    #[arg(short = 'n', long, default_value = "500")]
    txns: usize,

    /// Locks taken by each transaction
    #[arg(short, long, default_value = "4")]
    locks_per_txn: usize,

    /// Size of the key space
    #[arg(short, long, default_value = "10000")]
    keys: u64,

    /// Widest range a single lock covers
    #[arg(long, default_value = "16")]
    max_span: u64,

    /// Percentage of READ locks
    #[arg(short, long, default_value = "50")]
    read_pct: u8,

    /// Keyspaces (locktrees) to spread the load over
    #[arg(long, default_value = "2")]
    keyspaces: u64,

    /// Lock memory limit in KB
    #[arg(short = 'm', long, default_value = "65536")]
    max_lock_memory_kb: u64,

    /// Lock wait timeout in milliseconds
    #[arg(short = 'w', long, default_value = "200")]
    wait_timeout_ms: u64,

    /// RNG seed (each worker adds its index)
    #[arg(short, long, default_value = "42")]
    seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Outcome {
    Committed,
    Deadlock,
    Timeout,
    OutOfLocks,
    Other,
}

impl Outcome {
    fn from_error(e: &LockError) -> Self {
        match e {
            LockError::Deadlock { .. } => Outcome::Deadlock,
            LockError::LockWaitTimeout { .. } => Outcome::Timeout,
            LockError::OutOfLocks { .. } => Outcome::OutOfLocks,
            _ => Outcome::Other,
        }
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rangelock=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("rangelock stress v{}", rangelock::VERSION);
    tracing::info!(
        "{} threads x {} txns, {} locks each, {} keys",
        args.threads,
        args.txns,
        args.locks_per_txn,
        args.keys
    );

    let config = ManagerConfig::builder()
        .max_lock_memory(args.max_lock_memory_kb * 1024)
        .lock_wait_timeout(Duration::from_millis(args.wait_timeout_ms))
        .build();

    let registry = Arc::new(TxnRegistry::new());
    let policy = LockPolicy::new().with_range_set_listener(registry.clone());
    let manager = match LocktreeManager::new(config, policy) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let locktrees: Vec<_> = (0..args.keyspaces.max(1))
        .map(|id| {
            manager.get_or_create(id, Comparator::bytewise(), |lt| {
                lt.set_name(format!("keyspace-{}", id));
            })
        })
        .collect();

    let (tx, rx) = channel::unbounded();
    let started = Instant::now();

    let workers: Vec<_> = (0..args.threads)
        .map(|worker| {
            let tx = tx.clone();
            let manager = Arc::clone(&manager);
            let registry = Arc::clone(&registry);
            let locktrees = locktrees.clone();
            let seed = args.seed + worker as u64;
            let args = (args.txns, args.locks_per_txn, args.keys, args.max_span, args.read_pct);

            thread::spawn(move || {
                let (txns, locks_per_txn, keys, max_span, read_pct) = args;
                let mut rng = StdRng::seed_from_u64(seed);

                for _ in 0..txns {
                    let txn = Transaction::begin(&manager, &registry);
                    let mut outcome = Outcome::Committed;

                    for _ in 0..locks_per_txn {
                        let lt = &locktrees[rng.random_range(0..locktrees.len())];
                        let left = rng.random_range(0..keys);
                        let right = (left + rng.random_range(0..max_span.max(1))).min(keys);
                        let mode = if rng.random_range(0..100u8) < read_pct {
                            LockMode::Read
                        } else {
                            LockMode::Write
                        };

                        if let Err(e) = get_range_lock(&txn, lt, Key::from(left), Key::from(right), mode) {
                            outcome = Outcome::from_error(&e);
                            break;
                        }
                    }

                    if outcome == Outcome::Committed {
                        txn.commit();
                    } else {
                        txn.abort();
                    }
                    if tx.send(outcome).is_err() {
                        return;
                    }
                }
            })
        })
        .collect();
    drop(tx);

    let mut counts: BTreeMap<Outcome, u64> = BTreeMap::new();
    for outcome in rx {
        *counts.entry(outcome).or_default() += 1;
    }
    for worker in workers {
        if worker.join().is_err() {
            tracing::error!("Worker thread panicked");
        }
    }

    let elapsed = started.elapsed();
    let total: u64 = counts.values().sum();
    println!("{} transactions in {:?}", total, elapsed);
    for (outcome, count) in &counts {
        println!("  {:?}: {}", outcome, count);
    }
    println!("{}", manager.status());

    for lt in &locktrees {
        manager.release_lt(lt);
    }
}
