use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use clap::Parser;
use parking_lot::Mutex;
use vmkit_sync::{
    options::Options,
    prelude::*,
    sync::MonitorCounters,
};

/// Stress the object monitors with a contended counter and a bounded
/// producer/consumer queue.
#[derive(Parser, Debug)]
#[command(name = "vmkit-sync", version)]
struct Cli {
    /// Worker threads per workload.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Lock acquisitions per counter thread.
    #[arg(long, default_value_t = 100_000)]
    iterations: u64,

    /// Items pushed by each producer.
    #[arg(long, default_value_t = 10_000)]
    items: u64,

    /// Capacity of the producer/consumer queue.
    #[arg(long, default_value_t = 16)]
    capacity: usize,

    #[command(flatten)]
    options: Options,
}

fn contended_counter(sync: &Arc<ObjectSynchronizer>, threads: usize, iterations: u64) -> io::Result<u64> {
    let counter = Arc::new(AtomicU64::new(0));
    let object: ObjectRef = counter.clone();
    let mut handles = Vec::with_capacity(threads);
    for i in 0..threads {
        let sync = sync.clone();
        let object = object.clone();
        let counter = counter.clone();
        handles.push(Thread::start(format!("counter-{i}"), move || {
            let me = Thread::current();
            for _ in 0..iterations {
                let _locker = ObjectLocker::new(&sync, &object, me.clone());
                // Not an atomic increment: the monitor provides exclusion.
                let value = counter.load(Ordering::Relaxed);
                counter.store(value + 1, Ordering::Relaxed);
            }
        })?);
    }
    for handle in handles {
        if handle.join().ok().flatten().is_none() {
            log::error!("counter thread panicked");
        }
    }
    Ok(counter.load(Ordering::Relaxed))
}

fn producer_consumer(
    sync: &Arc<ObjectSynchronizer>,
    threads: usize,
    items: u64,
    capacity: usize,
) -> io::Result<u64> {
    let queue = Arc::new(Mutex::new(VecDeque::<u64>::with_capacity(capacity)));
    let object: ObjectRef = queue.clone();
    let total = items * threads as u64;
    let consumed = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(threads * 2);
    for i in 0..threads {
        let (sync, object, queue) = (sync.clone(), object.clone(), queue.clone());
        handles.push(Thread::start(format!("producer-{i}"), move || {
            let me = Thread::current();
            for item in 0..items {
                let locker = ObjectLocker::new(&sync, &object, me.clone());
                while queue.lock().len() >= capacity {
                    let _ = locker.wait_uninterruptibly(0);
                }
                queue.lock().push_back(item);
                let _ = locker.notify_all();
            }
        })?);
    }
    for i in 0..threads {
        let (sync, object, queue, consumed) =
            (sync.clone(), object.clone(), queue.clone(), consumed.clone());
        handles.push(Thread::start(format!("consumer-{i}"), move || {
            let me = Thread::current();
            loop {
                let locker = ObjectLocker::new(&sync, &object, me.clone());
                loop {
                    if consumed.load(Ordering::Relaxed) >= total {
                        return;
                    }
                    if queue.lock().pop_front().is_some() {
                        consumed.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    // Timed so that consumers notice the end of the stream.
                    let _ = locker.wait_uninterruptibly(10);
                }
                let _ = locker.notify_all();
            }
        })?);
    }
    for handle in handles {
        if handle.join().ok().flatten().is_none() {
            log::error!("producer/consumer thread panicked");
        }
    }
    Ok(consumed.load(Ordering::Relaxed))
}

fn main() -> io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let cli = Cli::parse();

    let mut config = cli.options.monitor_config();
    config.spin = config.spin.for_host();
    let sync = ObjectSynchronizer::new(config);
    let deflater = DeflationThread::start(sync.clone())?;

    let start = Instant::now();
    let count = contended_counter(&sync, cli.threads, cli.iterations)?;
    println!(
        "counter: {count} (expected {}) in {:?}",
        cli.iterations * cli.threads as u64,
        start.elapsed()
    );

    let start = Instant::now();
    let consumed = producer_consumer(&sync, cli.threads, cli.items, cli.capacity.max(1))?;
    println!(
        "producer/consumer: {consumed} items (expected {}) in {:?}",
        cli.items * cli.threads as u64,
        start.elapsed()
    );

    sync.request_deflation();
    deflater.stop();

    let counters = MonitorCounters::global().snapshot();
    println!("{counters:#?}");
    println!("monitors in use: {}", sync.in_use_count());
    Ok(())
}
