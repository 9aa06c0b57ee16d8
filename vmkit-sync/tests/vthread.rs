use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use vmkit_sync::prelude::*;

const PATIENCE: Duration = Duration::from_secs(10);

fn new_monitor() -> (ObjectRef, Arc<ObjectMonitor>) {
    let object: ObjectRef = Arc::new(());
    let monitor = ObjectMonitor::new(&object, SpinKnobs::default());
    (object, monitor)
}

fn wait_for_state(vthread: &VirtualThread, state: VThreadState) {
    let deadline = Instant::now() + PATIENCE;
    while vthread.state() != state {
        assert!(
            Instant::now() < deadline,
            "virtual thread stuck in {:?}, expected {state:?}",
            vthread.state()
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Drive `vthread` on `carrier` until its pending monitor operation
/// completes.
fn run_until_done(
    carrier: &Arc<Thread>,
    rx: &flume::Receiver<Arc<VirtualThread>>,
) -> ResumeResult {
    loop {
        let next = rx
            .recv_timeout(PATIENCE)
            .expect("virtual thread was never rescheduled");
        match next.resume(carrier) {
            ResumeResult::Blocked => continue,
            done => return done,
        }
    }
}

#[test]
fn contended_enter_unmounts_and_resumes() {
    let (_object, monitor) = new_monitor();
    let me = Thread::current();
    assert!(monitor.enter(&me).is_entered());

    let (yielded_tx, yielded_rx) = flume::bounded(1);
    let m = monitor.clone();
    let carrier = Thread::start("carrier", move || {
        let carrier = Thread::current();
        let (scheduler, rx) = ChannelScheduler::new();
        let vthread = VirtualThread::new(Some("contender".into()), scheduler);
        vthread.start(&carrier);

        assert_eq!(m.enter(&carrier), EnterResult::Preempted);
        vthread.yield_preempted(&carrier);
        // The carrier is free again.
        assert!(carrier.mounted_vthread().is_none());
        assert_eq!(carrier.owner_id(), carrier.id());
        yielded_tx.send(vthread.clone()).unwrap();

        assert_eq!(run_until_done(&carrier, &rx), ResumeResult::Entered);
        let owned_by_vthread = m.owner() == Owner::OwnedBy(vthread.id());
        m.exit(&carrier, true);
        vthread.terminate(&carrier);
        owned_by_vthread
    })
    .unwrap();

    let vthread = yielded_rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(vthread.state(), VThreadState::Blocked);
    assert_eq!(monitor.entry_list_len(), 1);
    // The unmounted contender keeps the monitor from being deflated.
    assert_eq!(monitor.contentions(), 1);
    assert!(!monitor.deflate_if_idle());
    monitor.exit(&me, true);

    assert!(carrier.join().unwrap().unwrap());
    assert_eq!(vthread.state(), VThreadState::Terminated);
    assert_eq!(monitor.contentions(), 0);
    assert_eq!(monitor.owner(), Owner::Unowned);
}

#[test]
fn pinned_vthread_blocks_its_carrier() {
    let (_object, monitor) = new_monitor();
    let me = Thread::current();
    assert!(monitor.enter(&me).is_entered());

    let m = monitor.clone();
    let carrier = Thread::start("carrier", move || {
        let carrier = Thread::current();
        let (scheduler, _rx) = ChannelScheduler::new();
        let vthread = VirtualThread::new(None, scheduler);
        vthread.start(&carrier);
        let entered = {
            let _pin = vthread.pin();
            m.enter(&carrier)
        };
        let owned_by_vthread = m.owner() == Owner::OwnedBy(vthread.id());
        // The owner id resolves to the carrier while the vthread is mounted.
        let carrier_found = ThreadManager::global()
            .owning_thread(vthread.id())
            .is_some_and(|t| t.id() == carrier.id());
        m.exit(&carrier, true);
        vthread.terminate(&carrier);
        (entered, owned_by_vthread && carrier_found)
    })
    .unwrap();

    let deadline = Instant::now() + PATIENCE;
    while monitor.entry_list_len() == 0 {
        assert!(Instant::now() < deadline, "pinned contender never queued");
        thread::sleep(Duration::from_millis(1));
    }
    monitor.exit(&me, true);
    assert_eq!(carrier.join().unwrap().unwrap(), (EnterResult::Entered, true));
}

#[test]
fn notified_vthread_completes_its_wait() {
    let (_object, monitor) = new_monitor();
    let (yielded_tx, yielded_rx) = flume::bounded(1);
    let m = monitor.clone();
    let carrier = Thread::start("carrier", move || {
        let carrier = Thread::current();
        let (scheduler, rx) = ChannelScheduler::new();
        let vthread = VirtualThread::new(Some("waiter".into()), scheduler);
        vthread.start(&carrier);

        assert!(m.enter(&carrier).is_entered());
        assert!(m.enter(&carrier).is_entered());
        assert_eq!(m.wait(&carrier, 0, true), Ok(WaitResult::Preempted));
        vthread.yield_preempted(&carrier);
        yielded_tx.send(vthread.clone()).unwrap();

        let result = run_until_done(&carrier, &rx);
        let recursions = m.recursions();
        m.exit(&carrier, true);
        m.exit(&carrier, true);
        vthread.terminate(&carrier);
        (result, recursions)
    })
    .unwrap();

    let vthread = yielded_rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(vthread.state(), VThreadState::Waiting);
    assert_eq!(monitor.wait_set_len(), 1);
    assert_eq!(monitor.waiters(), 1);

    let me = Thread::current();
    assert!(monitor.enter(&me).is_entered());
    monitor.notify(&me).unwrap();
    assert!(vthread.notified());
    assert_eq!(vthread.state(), VThreadState::Blocked);
    monitor.exit(&me, true);

    let (result, recursions) = carrier.join().unwrap().unwrap();
    assert_eq!(result, ResumeResult::WaitCompleted(Ok(WaitResult::Notified)));
    assert_eq!(recursions, 1);
    assert_eq!(monitor.waiters(), 0);
    assert_eq!(monitor.contentions(), 0);
}

#[test]
fn timed_vthread_wait_expires() {
    let (_object, monitor) = new_monitor();
    let m = monitor.clone();
    let result = Thread::start("carrier", move || {
        let carrier = Thread::current();
        let (scheduler, rx) = ChannelScheduler::new();
        let vthread = VirtualThread::new(None, scheduler);
        vthread.start(&carrier);

        assert!(m.enter(&carrier).is_entered());
        assert_eq!(m.wait(&carrier, 20, true), Ok(WaitResult::Preempted));
        vthread.yield_preempted(&carrier);
        assert!(matches!(
            vthread.state(),
            VThreadState::TimedWaiting | VThreadState::Unblocked
        ));

        let result = run_until_done(&carrier, &rx);
        let owner = m.has_owner(&carrier);
        m.exit(&carrier, true);
        vthread.terminate(&carrier);
        (result, owner)
    })
    .unwrap()
    .join()
    .unwrap()
    .unwrap();

    assert_eq!(result, (ResumeResult::WaitCompleted(Ok(WaitResult::TimedOut)), true));
    assert_eq!(monitor.wait_set_len(), 0);
    assert_eq!(monitor.waiters(), 0);
}

#[test]
fn interrupted_vthread_leaves_the_wait_set() {
    let (_object, monitor) = new_monitor();
    let (yielded_tx, yielded_rx) = flume::bounded(1);
    let m = monitor.clone();
    let carrier = Thread::start("carrier", move || {
        let carrier = Thread::current();
        let (scheduler, rx) = ChannelScheduler::new();
        let vthread = VirtualThread::new(None, scheduler);
        vthread.start(&carrier);

        assert!(m.enter(&carrier).is_entered());
        assert_eq!(m.wait(&carrier, 0, true), Ok(WaitResult::Preempted));
        vthread.yield_preempted(&carrier);
        yielded_tx.send(vthread.clone()).unwrap();

        let result = run_until_done(&carrier, &rx);
        let still_interrupted = vthread.is_interrupted(false);
        m.exit(&carrier, true);
        vthread.terminate(&carrier);
        (result, still_interrupted)
    })
    .unwrap();

    let vthread = yielded_rx.recv_timeout(PATIENCE).unwrap();
    wait_for_state(&vthread, VThreadState::Waiting);
    vthread.interrupt();

    let (result, still_interrupted) = carrier.join().unwrap().unwrap();
    assert_eq!(result, ResumeResult::WaitCompleted(Err(SyncError::Interrupted)));
    assert!(!still_interrupted);
    assert_eq!(monitor.wait_set_len(), 0);
}
