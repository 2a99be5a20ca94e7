//! The migration control state machine.
//!
//! One controller object owns session admission for the whole emulator: at
//! most one session is ongoing at a time, guarded by a mutex. Live sessions
//! run to completion inline on the caller; raw sessions run in a detached
//! worker thread that clears the admission flag when it finishes. Either
//! way the same put_ready loop drives the save: iterate until the saver
//! reports convergence, then stop the guest, drain, and complete.
//!
//! Cancellation and errors converge on the same idempotent cleanup: the
//! writer stops emitting, the transport closes (errors discarded), and any
//! session that started dirty logging stops it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::api::{
    Error, MigState, MigrationInfo, RawMode, Result, XferStats, DEFAULT_MAX_DOWNTIME_NS, MAX_THROTTLE,
};
use crate::codec::{write_stream_header, StreamReader, StreamWriter};
use crate::load::{process_incoming, MmapTable};
use crate::ram::RamRegistry;
use crate::save::{RamSaver, SaveStage};
use crate::transport::{self, IncomingSource, Transport};

/// Guest run states the controller drives at migration boundaries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    FinishMigrate,
    Postmigrate,
    Prelaunch,
}

/// Guest-runstate collaborator. The emulator implements this; the engine
/// only calls it at the stop/complete boundary of a session.
pub trait GuestHooks: Send + Sync {
    fn wakeup_request(&self) {}
    fn stop(&self, _state: RunState) {}
    fn start(&self) {}
    fn is_running(&self) -> bool {
        false
    }
    fn set_runstate(&self, _state: RunState) {}
}

struct NullHooks;

impl GuestHooks for NullHooks {}

type Notifier = Box<dyn Fn(MigState) + Send + Sync>;

#[derive(Default)]
struct RawLiveFlags {
    iterate: bool,
    stop: bool,
}

/// Iterate/stop handshake between the external raw-live driver and the
/// save worker. `iterate` is consumed by the wait; `stop` stays set until
/// the iteration poll consumes it, so a stop issued while the worker is
/// mid-iteration still lands.
struct RawLiveSignal {
    flags: Mutex<RawLiveFlags>,
    cond: Condvar,
}

impl RawLiveSignal {
    fn new() -> RawLiveSignal {
        RawLiveSignal { flags: Mutex::new(RawLiveFlags::default()), cond: Condvar::new() }
    }

    fn clear(&self) {
        *self.flags.lock().unwrap() = RawLiveFlags::default();
    }

    fn request_iterate(&self) {
        self.flags.lock().unwrap().iterate = true;
        self.cond.notify_all();
    }

    fn request_stop(&self) {
        self.flags.lock().unwrap().stop = true;
        self.cond.notify_all();
    }

    fn kick(&self) {
        self.cond.notify_all();
    }

    /// Block until iteration is requested, a stop is pending, or the
    /// session stops being active.
    fn wait_iterate(&self, cancelled: &dyn Fn() -> bool) {
        let mut flags = self.flags.lock().unwrap();
        loop {
            if flags.stop {
                return;
            }
            if flags.iterate {
                flags.iterate = false;
                return;
            }
            if cancelled() {
                return;
            }
            let (next, _) = self.cond.wait_timeout(flags, Duration::from_millis(50)).unwrap();
            flags = next;
        }
    }

    /// Non-blocking stop poll; returns true exactly once per request.
    fn consume_stop(&self) -> bool {
        let mut flags = self.flags.lock().unwrap();
        let stop = flags.stop;
        flags.stop = false;
        stop
    }
}

struct Session {
    state: MigState,
    #[allow(dead_code)]
    mode: RawMode,
    /// Pass-throughs for the block-migration collaborator.
    #[allow(dead_code)]
    blk: bool,
    #[allow(dead_code)]
    shared: bool,
    #[allow(dead_code)]
    detach: bool,
    /// Raised on cancel; the writer treats it as no-more-writes.
    shutdown: Option<Arc<AtomicBool>>,
}

impl Default for Session {
    fn default() -> Session {
        Session { state: MigState::Setup, mode: RawMode::None, blk: false, shared: false, detach: false, shutdown: None }
    }
}

struct Inner {
    registry: Arc<Mutex<RamRegistry>>,
    hooks: Box<dyn GuestHooks>,
    session: Mutex<Session>,
    /// Session admission. The sole cross-task synchronization primitive;
    /// everything else the worker touches is owned by the worker.
    ongoing: Mutex<bool>,
    notifiers: Mutex<Vec<(u64, Notifier)>>,
    next_notifier_id: AtomicU64,
    blockers: Mutex<Vec<String>>,
    bandwidth_limit: Arc<AtomicU64>,
    max_downtime_ns: AtomicU64,
    raw_live: RawLiveSignal,
    transferred: AtomicU64,
}

/// Process-wide migration controller, held by the emulator's top-level
/// context.
pub struct MigrationController {
    inner: Arc<Inner>,
}

impl MigrationController {
    pub fn new(registry: Arc<Mutex<RamRegistry>>) -> MigrationController {
        MigrationController::with_hooks(registry, Box::new(NullHooks))
    }

    pub fn with_hooks(registry: Arc<Mutex<RamRegistry>>, hooks: Box<dyn GuestHooks>) -> MigrationController {
        MigrationController {
            inner: Arc::new(Inner {
                registry,
                hooks,
                session: Mutex::new(Session::default()),
                ongoing: Mutex::new(false),
                notifiers: Mutex::new(Vec::new()),
                next_notifier_id: AtomicU64::new(1),
                blockers: Mutex::new(Vec::new()),
                bandwidth_limit: Arc::new(AtomicU64::new(MAX_THROTTLE)),
                max_downtime_ns: AtomicU64::new(DEFAULT_MAX_DOWNTIME_NS),
                raw_live: RawLiveSignal::new(),
                transferred: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> MigState {
        self.inner.state()
    }

    pub fn migration_is_active(&self) -> bool {
        self.state() == MigState::Active
    }

    pub fn migration_has_finished(&self) -> bool {
        self.state() == MigState::Completed
    }

    pub fn migration_has_failed(&self) -> bool {
        matches!(self.state(), MigState::Cancelled | MigState::Error)
    }

    /// True while a session (or its detached worker) holds admission.
    pub fn is_ongoing(&self) -> bool {
        *self.inner.ongoing.lock().unwrap()
    }

    /// Observers run synchronously on every state transition, in
    /// registration order. Returns a handle for removal.
    pub fn add_notifier(&self, notifier: impl Fn(MigState) + Send + Sync + 'static) -> u64 {
        let id = self.inner.next_notifier_id.fetch_add(1, Ordering::SeqCst);
        self.inner.notifiers.lock().unwrap().push((id, Box::new(notifier)));
        id
    }

    pub fn remove_notifier(&self, id: u64) {
        self.inner.notifiers.lock().unwrap().retain(|(nid, _)| *nid != id);
    }

    /// Register a reason that rejects migration attempts until removed.
    pub fn migrate_add_blocker(&self, reason: &str) {
        self.inner.blockers.lock().unwrap().push(reason.to_owned());
    }

    pub fn migrate_del_blocker(&self, reason: &str) {
        let mut blockers = self.inner.blockers.lock().unwrap();
        if let Some(pos) = blockers.iter().position(|b| b == reason) {
            blockers.remove(pos);
        }
    }

    /// Start a migration session. Live URIs run the whole save before
    /// returning; raw URIs hand the save to a detached worker and return
    /// immediately.
    pub fn migrate(&self, uri: &str, blk: bool, inc: bool, detach: bool) -> Result<()> {
        {
            let mut ongoing = self.inner.ongoing.lock().unwrap();
            if *ongoing {
                return Err(Error::MigrationActive);
            }
            *ongoing = true;
        }
        match self.migrate_start(uri, blk, inc, detach) {
            Ok(worker_owns_admission) => {
                if !worker_owns_admission {
                    self.inner.clear_ongoing();
                }
                Ok(())
            }
            Err(e) => {
                self.inner.clear_ongoing();
                Err(e)
            }
        }
    }

    fn migrate_start(&self, uri: &str, blk: bool, inc: bool, detach: bool) -> Result<bool> {
        let inner = &self.inner;
        if inner.state() == MigState::Active {
            return Err(Error::MigrationActive);
        }
        {
            let blockers = inner.blockers.lock().unwrap();
            if let Some(first) = blockers.first() {
                return Err(Error::Blocked(first.clone()));
            }
        }

        // Fresh session; the bandwidth limit survives across sessions.
        {
            let mut session = inner.session.lock().unwrap();
            *session = Session { blk, shared: inc, detach, ..Session::default() };
        }
        inner.transferred.store(0, Ordering::SeqCst);
        inner.raw_live.clear();

        let (xport, mode) = transport::outgoing(uri)?;
        log::info!("starting migration to {} ({:?} layout)", uri, mode);
        self.connect(xport, mode)
    }

    /// Setup -> Active: open the buffered writer over the transport and
    /// drive (or hand off) the save.
    fn connect(&self, xport: Box<dyn Transport>, mode: RawMode) -> Result<bool> {
        let inner = &self.inner;
        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let mut session = inner.session.lock().unwrap();
            session.state = MigState::Active;
            session.mode = mode;
            session.shutdown = Some(shutdown.clone());
        }
        inner.notify(MigState::Active);

        let writer = StreamWriter::new(xport, inner.bandwidth_limit.clone(), shutdown);
        match mode {
            RawMode::None => {
                inner.run_save(writer, mode)?;
                Ok(false)
            }
            RawMode::Suspend | RawMode::Live => {
                let worker = Arc::clone(inner);
                std::thread::spawn(move || {
                    let _ = worker.run_save(writer, mode);
                    worker.clear_ongoing();
                });
                Ok(true)
            }
        }
    }

    /// User cancel. The transition happens here; resource cleanup happens
    /// at the save loop's next checkpoint, where the resources live.
    pub fn migrate_cancel(&self) {
        {
            let mut session = self.inner.session.lock().unwrap();
            if session.state != MigState::Active {
                return;
            }
            log::info!("cancelling migration");
            session.state = MigState::Cancelled;
            if let Some(shutdown) = &session.shutdown {
                shutdown.store(true, Ordering::SeqCst);
            }
        }
        self.inner.notify(MigState::Cancelled);
        // Wake a raw-live worker parked in its iterate wait.
        self.inner.raw_live.kick();
    }

    pub fn migrate_set_speed(&self, value: i64) {
        let value = if value < 0 { 0 } else { value as u64 };
        self.inner.bandwidth_limit.store(value, Ordering::SeqCst);
    }

    pub fn bandwidth_limit(&self) -> u64 {
        self.inner.bandwidth_limit.load(Ordering::SeqCst)
    }

    /// Downtime bound in seconds; stored in nanoseconds, clamped to
    /// [0, u64::MAX].
    pub fn migrate_set_downtime(&self, value: f64) {
        let ns = (value * 1e9).max(0.0).min(u64::MAX as f64) as u64;
        self.inner.max_downtime_ns.store(ns, Ordering::SeqCst);
    }

    pub fn max_downtime_ns(&self) -> u64 {
        self.inner.max_downtime_ns.load(Ordering::SeqCst)
    }

    /// External raw-live driver: request one more iteration.
    pub fn iterate_raw_live(&self) {
        if self.inner.state() != MigState::Active {
            return;
        }
        self.inner.raw_live.request_iterate();
    }

    /// External raw-live driver: request the session to finish.
    pub fn stop_raw_live(&self) {
        if self.inner.state() != MigState::Active {
            return;
        }
        self.inner.raw_live.request_stop();
    }

    pub fn query_migrate(&self) -> MigrationInfo {
        let state = self.inner.state();
        let mut info = MigrationInfo { status: state.as_str(), ..MigrationInfo::default() };
        if state == MigState::Active {
            let regs = self.inner.registry.lock().unwrap();
            info.ram = Some(XferStats {
                transferred: self.inner.transferred.load(Ordering::SeqCst),
                remaining: regs.remaining_bytes(),
                total: regs.total_bytes(),
            });
            // disk stats belong to the block-migration collaborator
        }
        info
    }
}

impl Inner {
    fn state(&self) -> MigState {
        self.session.lock().unwrap().state
    }

    fn clear_ongoing(&self) {
        *self.ongoing.lock().unwrap() = false;
    }

    fn downtime(&self) -> u64 {
        self.max_downtime_ns.load(Ordering::SeqCst)
    }

    fn notify(&self, state: MigState) {
        for (_, notifier) in self.notifiers.lock().unwrap().iter() {
            notifier(state);
        }
    }

    /// Transition out of Active into a terminal state. Cancel wins: a
    /// session cancelled while failing stays Cancelled.
    fn set_terminal(&self, state: MigState) {
        {
            let mut session = self.session.lock().unwrap();
            if session.state != MigState::Active {
                return;
            }
            session.state = state;
        }
        self.notify(state);
    }

    fn sync_stats(&self, saver: &RamSaver) {
        self.transferred.store(saver.bytes_transferred(), Ordering::SeqCst);
    }

    fn run_save(&self, mut f: StreamWriter, mode: RawMode) -> Result<()> {
        let mut saver = RamSaver::new();
        let res = self.savevm(&mut f, &mut saver, mode);
        if let Err(e) = &res {
            log::warn!("migration failed: {}", e);
            self.set_terminal(MigState::Error);
            let mut regs = self.registry.lock().unwrap();
            saver.abort(&mut regs);
            drop(regs);
            // best-effort close; cleanup errors are discarded
            let _ = f.close();
        }
        res
    }

    fn savevm(&self, f: &mut StreamWriter, saver: &mut RamSaver, mode: RawMode) -> Result<()> {
        write_stream_header(f);

        // savevm begin
        {
            let mut regs = self.registry.lock().unwrap();
            match mode {
                RawMode::None => {
                    saver.live(f, &mut regs, SaveStage::Setup, self.downtime())?;
                }
                RawMode::Suspend => {}
                RawMode::Live => {
                    saver.raw_live(f, &mut regs, SaveStage::Setup, &mut || false)?;
                }
            }
        }
        self.sync_stats(saver);

        // put_ready loop
        loop {
            if self.state() != MigState::Active {
                log::info!("put_ready returning because of non-active state");
                let mut regs = self.registry.lock().unwrap();
                saver.abort(&mut regs);
                drop(regs);
                let _ = f.close();
                return Ok(());
            }

            if mode == RawMode::Live {
                self.raw_live.wait_iterate(&|| self.state() != MigState::Active);
                if self.state() != MigState::Active {
                    continue;
                }
            }

            let done = {
                let mut regs = self.registry.lock().unwrap();
                match mode {
                    RawMode::None => saver.live(f, &mut regs, SaveStage::Iterate, self.downtime())?,
                    RawMode::Suspend => {
                        saver.raw_suspend(f, &mut regs)?;
                        true
                    }
                    RawMode::Live => {
                        let signal = &self.raw_live;
                        saver.raw_live(f, &mut regs, SaveStage::Iterate, &mut || signal.consume_stop())?
                    }
                }
            };
            self.sync_stats(saver);

            if done {
                log::info!("migration converged; stopping guest for the final drain");
                let was_running = self.hooks.is_running();
                self.hooks.wakeup_request();
                self.hooks.stop(RunState::FinishMigrate);

                let completed = {
                    let mut regs = self.registry.lock().unwrap();
                    match mode {
                        RawMode::None => saver.live(f, &mut regs, SaveStage::Final, self.downtime()).map(|_| ()),
                        RawMode::Suspend => Ok(()),
                        RawMode::Live => {
                            saver.raw_live(f, &mut regs, SaveStage::Final, &mut || false).map(|_| ())
                        }
                    }
                };
                self.sync_stats(saver);

                let finished = completed.and_then(|_| f.close());
                match finished {
                    Ok(()) => {
                        self.set_terminal(MigState::Completed);
                        self.hooks.set_runstate(RunState::Postmigrate);
                    }
                    Err(e) => {
                        self.set_terminal(MigState::Error);
                        let mut regs = self.registry.lock().unwrap();
                        saver.abort(&mut regs);
                        drop(regs);
                        if was_running {
                            self.hooks.start();
                        }
                        return Err(e);
                    }
                }
                return Ok(());
            }

            // Not converged; yield until the rate window refills before the
            // next round.
            if mode == RawMode::None {
                f.rate_wait();
            }
        }
    }
}

/// Accept an incoming migration on `uri` and restore it into `regs`.
/// Returns the table of raw restore mappings (empty for live streams) so
/// they can be torn down at a well-defined shutdown point.
pub fn start_incoming_migration(uri: &str, regs: &mut RamRegistry) -> Result<MmapTable> {
    let (source, _mode) = transport::incoming(uri)?;
    let mut reader = match source {
        IncomingSource::File(file) => StreamReader::from_file(file),
        IncomingSource::Stream(stream) => StreamReader::from_stream(stream),
    };
    process_incoming(&mut reader, regs)
}
