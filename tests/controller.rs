//! Controller-level behavior: session admission, state transitions,
//! cancellation, the raw-live driver handshake, and full migrations over
//! real transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::{RngCore, SeedableRng};
use rammig::{
    start_incoming_migration, Error, GuestHooks, MigState, MigrationController, RamRegistry,
    RunState, PAGE_SIZE,
};

fn init_logging() {
    let _ = env_logger::try_init();
}

fn registry_with(names: &[(&str, usize)], seed: u64) -> Arc<Mutex<RamRegistry>> {
    let mut regs = RamRegistry::new();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    for &(name, pages) in names {
        regs.alloc_region(name, pages * PAGE_SIZE).unwrap();
        let index = regs.find(name).unwrap();
        for page in 0..pages {
            let mut buf = vec![0u8; PAGE_SIZE];
            rng.fill_bytes(&mut buf);
            regs.get_mut(index).write(page * PAGE_SIZE, &buf);
        }
    }
    Arc::new(Mutex::new(regs))
}

fn region_bytes(regs: &RamRegistry) -> Vec<Vec<u8>> {
    regs.iter()
        .map(|r| {
            let mut buf = vec![0u8; r.len()];
            r.read(0, &mut buf);
            buf
        })
        .collect()
}

fn wait_not_ongoing(ctl: &MigrationController, secs: u64) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while ctl.is_ongoing() {
        assert!(Instant::now() < deadline, "migration worker did not finish in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[derive(Default)]
struct RecordingHooks {
    wakeup: AtomicBool,
    stopped: AtomicBool,
    postmigrate: AtomicBool,
}

impl GuestHooks for RecordingHooks {
    fn wakeup_request(&self) {
        self.wakeup.store(true, Ordering::SeqCst);
    }
    fn stop(&self, state: RunState) {
        if state == RunState::FinishMigrate {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }
    fn is_running(&self) -> bool {
        true
    }
    fn set_runstate(&self, state: RunState) {
        if state == RunState::Postmigrate {
            self.postmigrate.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn raw_suspend_end_to_end() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("suspend.raw");
    let uri = format!("raw:{}", path.display());

    let registry = registry_with(&[("pc.ram", 8), ("pc.bios", 2)], 11);
    let hooks = Arc::new(RecordingHooks::default());
    let hooks_view = hooks.clone();
    struct Fwd(Arc<RecordingHooks>);
    impl GuestHooks for Fwd {
        fn wakeup_request(&self) {
            self.0.wakeup_request()
        }
        fn stop(&self, state: RunState) {
            self.0.stop(state)
        }
        fn is_running(&self) -> bool {
            self.0.is_running()
        }
        fn set_runstate(&self, state: RunState) {
            self.0.set_runstate(state)
        }
    }
    let ctl = MigrationController::with_hooks(registry.clone(), Box::new(Fwd(hooks)));

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = transitions.clone();
    ctl.add_notifier(move |state| seen.lock().unwrap().push(state));

    ctl.migrate(&uri, false, false, true).unwrap();
    wait_not_ongoing(&ctl, 10);

    assert_eq!(ctl.state(), MigState::Completed);
    assert!(ctl.migration_has_finished());
    assert_eq!(ctl.query_migrate().status, Some("completed"));
    assert!(hooks_view.wakeup.load(Ordering::SeqCst));
    assert!(hooks_view.stopped.load(Ordering::SeqCst));
    assert!(hooks_view.postmigrate.load(Ordering::SeqCst));
    assert_eq!(
        *transitions.lock().unwrap(),
        vec![MigState::Active, MigState::Completed]
    );

    // cancel after complete is a no-op: state stays Completed
    ctl.migrate_cancel();
    assert_eq!(ctl.state(), MigState::Completed);

    // restore into a fresh registry and compare
    let mut dest = RamRegistry::new();
    dest.alloc_region("pc.ram", 8 * PAGE_SIZE).unwrap();
    dest.alloc_region("pc.bios", 2 * PAGE_SIZE).unwrap();
    let mut table = start_incoming_migration(&uri, &mut dest).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(region_bytes(&registry.lock().unwrap()), region_bytes(&dest));
    table.unmap_all();
}

#[test]
fn second_migrate_while_ongoing_is_rejected() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rawlive.raw");
    let uri = format!("rawlive:{}", path.display());

    let registry = registry_with(&[("ram", 4)], 3);
    let ctl = MigrationController::new(registry);

    ctl.migrate(&uri, false, false, true).unwrap();
    // the worker is parked waiting for an iterate request
    assert!(ctl.is_ongoing());
    assert!(ctl.migration_is_active());
    let err = ctl.migrate(&uri, false, false, true).unwrap_err();
    assert!(matches!(err, Error::MigrationActive));

    // an active session reports ram counters
    let info = ctl.query_migrate();
    assert_eq!(info.status, Some("active"));
    let ram = info.ram.unwrap();
    assert_eq!(ram.total, 4 * PAGE_SIZE as u64);
    assert!(info.disk.is_none());

    ctl.stop_raw_live();
    wait_not_ongoing(&ctl, 10);
    assert_eq!(ctl.state(), MigState::Completed);
}

#[test]
fn raw_live_driver_iterates_then_stops() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("driven.raw");
    let uri = format!("rawlive:{}", path.display());

    let registry = registry_with(&[("ram", 6)], 17);
    let ctl = MigrationController::new(registry.clone());
    ctl.migrate(&uri, false, false, true).unwrap();

    // guest writes land between iterations
    {
        let mut regs = registry.lock().unwrap();
        let newer = vec![0x42u8; PAGE_SIZE];
        regs.get_mut(0).write(3 * PAGE_SIZE, &newer);
        regs.set_dirty(0, 3 * PAGE_SIZE, PAGE_SIZE);
    }
    ctl.iterate_raw_live();
    std::thread::sleep(Duration::from_millis(100));
    assert!(ctl.migration_is_active(), "iterate alone must not finish the session");

    ctl.stop_raw_live();
    wait_not_ongoing(&ctl, 10);
    assert_eq!(ctl.state(), MigState::Completed);

    let mut dest = RamRegistry::new();
    dest.alloc_region("ram", 6 * PAGE_SIZE).unwrap();
    let mut table = start_incoming_migration(&uri, &mut dest).unwrap();
    assert_eq!(region_bytes(&registry.lock().unwrap()), region_bytes(&dest));
    assert_eq!(dest.get(0).page(3 * PAGE_SIZE)[0], 0x42);
    table.unmap_all();
}

#[test]
fn cancel_parked_raw_live_session() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cancelled.raw");
    let uri = format!("rawlive:{}", path.display());

    let registry = registry_with(&[("ram", 4)], 29);
    let ctl = MigrationController::new(registry.clone());
    ctl.migrate(&uri, false, false, true).unwrap();
    assert!(ctl.migration_is_active());

    ctl.migrate_cancel();
    wait_not_ongoing(&ctl, 10);
    assert_eq!(ctl.state(), MigState::Cancelled);
    assert_eq!(ctl.query_migrate().status, Some("cancelled"));
    assert!(ctl.migration_has_failed());
    // cleanup must have stopped dirty logging even though the session was
    // cancelled, not completed
    assert!(!registry.lock().unwrap().log_on());

    // admission is free again
    let path2 = dir.path().join("after.raw");
    ctl.migrate(&format!("raw:{}", path2.display()), false, false, true).unwrap();
    wait_not_ongoing(&ctl, 10);
    assert_eq!(ctl.state(), MigState::Completed);
}

#[test]
fn cancel_live_save_mid_iteration() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let sink = dir.path().join("sink");
    let uri = format!("exec:cat > {}", sink.display());

    let registry = registry_with(&[("ram", 50)], 31);
    let ctl = Arc::new(MigrationController::new(registry.clone()));
    // throttle hard so the save takes many rounds
    ctl.migrate_set_speed(10 * PAGE_SIZE as i64);

    let canceller = ctl.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        canceller.migrate_cancel();
    });

    // live migration runs inline; the cancel from the other thread makes
    // the put_ready loop exit at its next checkpoint
    let _ = ctl.migrate(&uri, false, false, false);
    handle.join().unwrap();

    assert_eq!(ctl.state(), MigState::Cancelled);
    assert_eq!(ctl.query_migrate().status, Some("cancelled"));
    assert!(!registry.lock().unwrap().log_on());
    assert!(!ctl.is_ongoing());
}

#[test]
fn live_migration_over_a_unix_socket() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("mig.sock");
    let uri = format!("unix:{}", sock.display());

    let registry = registry_with(&[("pc.ram", 12), ("vga.vram", 3)], 61);
    let ctl = MigrationController::new(registry.clone());

    let receiver_uri = uri.clone();
    let receiver = std::thread::spawn(move || {
        let mut dest = RamRegistry::new();
        dest.alloc_region("pc.ram", 12 * PAGE_SIZE).unwrap();
        dest.alloc_region("vga.vram", 3 * PAGE_SIZE).unwrap();
        let table = start_incoming_migration(&receiver_uri, &mut dest).unwrap();
        assert!(table.is_empty());
        dest
    });

    ctl.migrate(&uri, false, false, false).unwrap();
    assert_eq!(ctl.state(), MigState::Completed);
    assert!(!ctl.is_ongoing());

    let dest = receiver.join().unwrap();
    assert_eq!(region_bytes(&registry.lock().unwrap()), region_bytes(&dest));
}

#[test]
fn terminal_query_reports_status_without_counters() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let sink = dir.path().join("sink");
    let uri = format!("exec:cat > {}", sink.display());

    // All-uniform pages: each page accounts a single byte.
    let registry = Arc::new(Mutex::new({
        let mut regs = RamRegistry::new();
        regs.alloc_region("ram", 16 * PAGE_SIZE).unwrap();
        regs.get_mut(0).write(0, &vec![0x77; 16 * PAGE_SIZE]);
        regs
    }));
    let ctl = MigrationController::new(registry);
    ctl.migrate(&uri, false, false, false).unwrap();
    assert_eq!(ctl.state(), MigState::Completed);
    // The counter is only visible through query while active, so check the
    // terminal status shape instead: no ram block after completion.
    let info = ctl.query_migrate();
    assert_eq!(info.status, Some("completed"));
    assert!(info.ram.is_none());
}
