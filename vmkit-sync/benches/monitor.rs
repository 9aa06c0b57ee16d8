use std::{
    hint::black_box,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use criterion::{criterion_group, criterion_main, Criterion};
use vmkit_sync::prelude::*;

pub fn criterion_benchmark(c: &mut Criterion) {
    let object: ObjectRef = Arc::new(());
    let monitor = ObjectMonitor::new(&object, SpinKnobs::default());
    let me = Thread::current();

    c.bench_function("uncontended enter/exit", |b| {
        b.iter(|| {
            let _ = black_box(monitor.enter(&me));
            monitor.exit(&me, true);
        });
    });

    c.bench_function("recursive enter/exit", |b| {
        let _ = monitor.enter(&me);
        b.iter(|| {
            let _ = black_box(monitor.enter(&me));
            monitor.exit(&me, true);
        });
        monitor.exit(&me, true);
    });

    c.bench_function("synchronizer lock", |b| {
        let sync = ObjectSynchronizer::new(MonitorConfig::default());
        b.iter(|| {
            let _locker = ObjectLocker::new(&sync, &object, me.clone());
        });
    });

    c.bench_function("contended enter/exit", |b| {
        let stop = Arc::new(AtomicBool::new(false));
        let rival = {
            let monitor = monitor.clone();
            let stop = stop.clone();
            Thread::start("rival", move || {
                let me = Thread::current();
                while !stop.load(Ordering::Relaxed) {
                    let _ = monitor.enter(&me);
                    std::hint::spin_loop();
                    monitor.exit(&me, true);
                }
            })
            .unwrap()
        };
        b.iter(|| {
            let _ = black_box(monitor.enter(&me));
            monitor.exit(&me, true);
        });
        stop.store(true, Ordering::Relaxed);
        rival.join().unwrap();
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
