use crate::concurrency::shutdown_requested;
use crate::units::{Outcome, ServiceUnit, UnitContext};
use crate::CoreError;
use cloudstrap_schema::RetryPolicy;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Relation,
    PostProcess,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Setup => write!(f, "setup"),
            Stage::Relation => write!(f, "relation"),
            Stage::PostProcess => write!(f, "post-process"),
        }
    }
}

/// A unit waiting in one of the backlogs.
pub struct QueueItem {
    pub unit: Arc<dyn ServiceUnit>,
    /// Attempts made so far; informational unless the retry policy is bounded.
    pub attempts: u32,
    not_before: Option<Instant>,
}

impl QueueItem {
    fn new(unit: Arc<dyn ServiceUnit>) -> Self {
        Self {
            unit,
            attempts: 0,
            not_before: None,
        }
    }
}

/// A unit dropped from its backlog without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckUnit {
    pub name: String,
    pub stage: Stage,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub deployed: Vec<String>,
    pub wired: Vec<String>,
    pub stuck: Vec<StuckUnit>,
}

impl QueueReport {
    pub fn is_clean(&self) -> bool {
        self.stuck.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Pause after every processed item.
    pub settle_interval: Duration,
    pub retry: RetryPolicy,
    /// How often an idle worker wakes to check for shutdown.
    pub idle_poll: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            settle_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            idle_poll: Duration::from_millis(200),
        }
    }
}

#[derive(Default)]
struct Shared {
    stop: AtomicBool,
    pending_setup: AtomicUsize,
    pending_relation: AtomicUsize,
    report: Mutex<QueueReport>,
}

impl Shared {
    fn pending(&self, stage: Stage) -> &AtomicUsize {
        match stage {
            Stage::Setup => &self.pending_setup,
            Stage::Relation | Stage::PostProcess => &self.pending_relation,
        }
    }

    fn finish(&self, stage: Stage) {
        self.pending(stage).fetch_sub(1, Ordering::SeqCst);
    }

    fn record(&self, f: impl FnOnce(&mut QueueReport)) {
        let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut report);
    }

    fn snapshot(&self) -> QueueReport {
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn stuck(&self, item: &QueueItem, stage: Stage, reason: String) {
        error!(
            "{} {stage} gave up after {} attempt(s): {reason}",
            item.unit.name(),
            item.attempts
        );
        self.record(|r| {
            r.stuck.push(StuckUnit {
                name: item.unit.name().to_owned(),
                stage,
                attempts: item.attempts,
                reason,
            });
        });
    }
}

enum Step {
    Processed,
    /// Dequeued before its backoff ran out and put back.
    Deferred(Instant),
    Closed,
}

/// How long to pause once every pending item has been found backed off.
fn deferral_pause(
    deferred: usize,
    pending: usize,
    earliest: Instant,
    now: Instant,
    idle_poll: Duration,
) -> Option<Duration> {
    (deferred >= pending).then(|| earliest.saturating_duration_since(now).min(idle_poll))
}

struct Worker {
    stage: Stage,
    rx: Receiver<QueueItem>,
    requeue: Sender<QueueItem>,
    ctx: UnitContext,
    config: QueueConfig,
    shared: Arc<Shared>,
    interrupted: fn() -> bool,
}

impl Worker {
    fn run(self) {
        debug!("starting {} worker", self.stage);
        let mut deferred = 0;
        let mut earliest: Option<Instant> = None;
        loop {
            if self.shared.stop.load(Ordering::SeqCst) || (self.interrupted)() {
                break;
            }
            let item = match self.rx.recv_timeout(self.config.idle_poll) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match self.process(item) {
                Step::Processed => {
                    deferred = 0;
                    earliest = None;
                    thread::sleep(self.config.settle_interval);
                }
                Step::Deferred(due) => {
                    deferred += 1;
                    let first_due = earliest.map_or(due, |e| e.min(due));
                    earliest = Some(first_due);
                    let pending = self.shared.pending(self.stage).load(Ordering::SeqCst);
                    if let Some(pause) = deferral_pause(
                        deferred,
                        pending,
                        first_due,
                        Instant::now(),
                        self.config.idle_poll,
                    ) {
                        thread::sleep(pause);
                        deferred = 0;
                        earliest = None;
                    }
                }
                Step::Closed => break,
            }
        }
        debug!("{} worker stopped", self.stage);
    }

    fn process(&self, mut item: QueueItem) -> Step {
        if let Some(due) = item.not_before.filter(|due| Instant::now() < *due) {
            return if self.requeue.send(item).is_ok() {
                Step::Deferred(due)
            } else {
                Step::Closed
            };
        }
        item.not_before = None;
        item.attempts += 1;
        debug!(
            "{} {}: attempt {}",
            self.stage,
            item.unit.name(),
            item.attempts
        );

        let outcome = match self.stage {
            Stage::Setup => item.unit.setup(&self.ctx),
            Stage::Relation | Stage::PostProcess => item.unit.set_relations(&self.ctx),
        };

        match outcome {
            Outcome::Done => {
                self.complete(&item);
                self.shared.finish(self.stage);
                Step::Processed
            }
            Outcome::Retry(reason) => {
                if !self.config.retry.allows_retry(item.attempts) {
                    self.shared.stuck(&item, self.stage, reason);
                    self.shared.finish(self.stage);
                    return Step::Processed;
                }
                info!(
                    "{} {} not ready, requeueing: {reason}",
                    item.unit.name(),
                    self.stage
                );
                let delay = self.config.retry.backoff.delay(item.attempts);
                if !delay.is_zero() {
                    item.not_before = Some(Instant::now() + delay);
                }
                if self.requeue.send(item).is_ok() {
                    Step::Processed
                } else {
                    Step::Closed
                }
            }
            Outcome::Failed(reason) => {
                self.shared.stuck(&item, self.stage, reason);
                self.shared.finish(self.stage);
                Step::Processed
            }
        }
    }

    fn complete(&self, item: &QueueItem) {
        let name = item.unit.name().to_owned();
        match self.stage {
            Stage::Setup => self.shared.record(|r| r.deployed.push(name)),
            Stage::Relation | Stage::PostProcess => {
                if let Err(e) = item.unit.post_process(&self.ctx) {
                    self.shared.stuck(item, Stage::PostProcess, e.to_string());
                } else {
                    self.shared.record(|r| r.wired.push(name));
                }
            }
        }
    }
}

/// Setup and relation backlogs, each drained by one dedicated worker thread.
///
/// Items are processed FIFO; a requeued item goes to the back of its own
/// backlog. The two backlogs are not ordered with respect to each other.
pub struct DeploymentQueue {
    setup_tx: Sender<QueueItem>,
    relation_tx: Sender<QueueItem>,
    receivers: Option<(Receiver<QueueItem>, Receiver<QueueItem>)>,
    ctx: UnitContext,
    config: QueueConfig,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    interrupted: fn() -> bool,
}

impl DeploymentQueue {
    pub fn new(ctx: UnitContext, config: QueueConfig) -> Self {
        let (setup_tx, setup_rx) = mpsc::channel();
        let (relation_tx, relation_rx) = mpsc::channel();
        Self {
            setup_tx,
            relation_tx,
            receivers: Some((setup_rx, relation_rx)),
            ctx,
            config,
            shared: Arc::new(Shared::default()),
            workers: Vec::new(),
            interrupted: shutdown_requested,
        }
    }

    #[cfg(test)]
    #[must_use]
    fn with_interrupt(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    /// Spawn the setup and relation workers. Items enqueued before this are
    /// kept and processed once the workers run.
    pub fn start(&mut self) -> Result<(), CoreError> {
        let (setup_rx, relation_rx) = self.receivers.take().ok_or(CoreError::QueueStarted)?;
        for (stage, rx, requeue) in [
            (Stage::Setup, setup_rx, self.setup_tx.clone()),
            (Stage::Relation, relation_rx, self.relation_tx.clone()),
        ] {
            let worker = Worker {
                stage,
                rx,
                requeue,
                ctx: self.ctx.clone(),
                config: self.config,
                shared: Arc::clone(&self.shared),
                interrupted: self.interrupted,
            };
            let handle = thread::Builder::new()
                .name(format!("cloudstrap-{stage}"))
                .spawn(move || worker.run())?;
            self.workers.push(handle);
        }
        Ok(())
    }

    pub fn enqueue_setup(&self, unit: Arc<dyn ServiceUnit>) {
        self.enqueue(Stage::Setup, unit);
    }

    pub fn enqueue_relation(&self, unit: Arc<dyn ServiceUnit>) {
        self.enqueue(Stage::Relation, unit);
    }

    fn enqueue(&self, stage: Stage, unit: Arc<dyn ServiceUnit>) {
        let tx = match stage {
            Stage::Setup => &self.setup_tx,
            Stage::Relation | Stage::PostProcess => &self.relation_tx,
        };
        self.shared.pending(stage).fetch_add(1, Ordering::SeqCst);
        if tx.send(QueueItem::new(unit)).is_err() {
            warn!("{stage} backlog closed, dropping item");
            self.shared.finish(stage);
        }
    }

    /// Items not yet completed or given up on, as `(setup, relation)`.
    pub fn pending(&self) -> (usize, usize) {
        (
            self.shared.pending_setup.load(Ordering::SeqCst),
            self.shared.pending_relation.load(Ordering::SeqCst),
        )
    }

    pub fn report(&self) -> QueueReport {
        self.shared.snapshot()
    }

    /// Block until both backlogs are empty, or until `timeout` passes.
    ///
    /// Per-item failures do not stop the workers; they are returned in the
    /// report for the caller to act on.
    pub fn wait_until_settled(&self, timeout: Option<Duration>) -> Result<QueueReport, CoreError> {
        let started = Instant::now();
        let poll = self
            .config
            .settle_interval
            .clamp(Duration::from_millis(5), Duration::from_millis(250));
        loop {
            let (setup, relation) = self.pending();
            if setup == 0 && relation == 0 {
                return Ok(self.report());
            }
            if timeout.is_some_and(|t| started.elapsed() >= t) || (self.interrupted)() {
                return Err(CoreError::QueueTimeout { setup, relation });
            }
            thread::sleep(poll);
        }
    }

    /// Stop both workers and wait for them to exit.
    pub fn shutdown(&mut self) -> QueueReport {
        self.shared.stop.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("queue worker panicked");
            }
        }
        self.report()
    }
}

impl Drop for DeploymentQueue {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingProgress;
    use cloudstrap_cluster::MockManager;
    use cloudstrap_schema::{Backoff, ServiceUnitDescriptor, UnitOverrides};

    /// Scripted unit that logs every invocation into a shared journal.
    struct Scripted {
        descriptor: ServiceUnitDescriptor,
        journal: Arc<Mutex<Vec<String>>>,
        retries_left: AtomicUsize,
        fail: bool,
        post_fail: bool,
    }

    impl Scripted {
        fn new(name: &str, retries: usize, journal: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                descriptor: ServiceUnitDescriptor::new(name).unwrap(),
                journal: Arc::clone(journal),
                retries_left: AtomicUsize::new(retries),
                fail: false,
                post_fail: false,
            })
        }

        fn step(&self, op: &str) -> Outcome {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{op}:{}", self.descriptor.name()));
            if self.fail {
                return Outcome::Failed("rejected".to_owned());
            }
            let left = self.retries_left.load(Ordering::SeqCst);
            if left > 0 {
                self.retries_left.store(left - 1, Ordering::SeqCst);
                Outcome::Retry("not yet".to_owned())
            } else {
                Outcome::Done
            }
        }
    }

    impl ServiceUnit for Scripted {
        fn descriptor(&self) -> &ServiceUnitDescriptor {
            &self.descriptor
        }

        fn setup(&self, _ctx: &UnitContext) -> Outcome {
            self.step("setup")
        }

        fn set_relations(&self, _ctx: &UnitContext) -> Outcome {
            self.step("relate")
        }

        fn post_process(&self, _ctx: &UnitContext) -> Result<(), CoreError> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("post:{}", self.descriptor.name()));
            if self.post_fail {
                return Err(CoreError::PostProcess {
                    unit: self.descriptor.name().to_owned(),
                    reason: "disk full".to_owned(),
                });
            }
            Ok(())
        }
    }

    fn ctx() -> UnitContext {
        UnitContext {
            manager: Arc::new(MockManager::new()),
            overrides: Arc::new(UnitOverrides::new()),
            progress: Arc::new(RecordingProgress::new()),
        }
    }

    fn fast(retry: RetryPolicy) -> QueueConfig {
        QueueConfig {
            settle_interval: Duration::ZERO,
            retry,
            idle_poll: Duration::from_millis(5),
        }
    }

    const WAIT: Option<Duration> = Some(Duration::from_secs(10));

    #[test]
    fn requeued_item_goes_to_back() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeploymentQueue::new(ctx(), fast(RetryPolicy::unbounded()));
        queue.enqueue_setup(Scripted::new("a", 1, &journal));
        queue.enqueue_setup(Scripted::new("b", 0, &journal));
        queue.start().unwrap();

        let report = queue.wait_until_settled(WAIT).unwrap();
        queue.shutdown();

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["setup:a", "setup:b", "setup:a"]
        );
        assert_eq!(report.deployed, vec!["b".to_owned(), "a".to_owned()]);
        assert!(report.is_clean());
    }

    #[test]
    fn relation_success_runs_post_process_once() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeploymentQueue::new(ctx(), fast(RetryPolicy::unbounded()));
        queue.start().unwrap();
        queue.enqueue_relation(Scripted::new("x", 2, &journal));

        let report = queue.wait_until_settled(WAIT).unwrap();
        queue.shutdown();

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["relate:x", "relate:x", "relate:x", "post:x"]
        );
        assert_eq!(report.wired, vec!["x".to_owned()]);
    }

    #[test]
    fn bounded_policy_gives_up_and_reports() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeploymentQueue::new(ctx(), fast(RetryPolicy::bounded(3, Backoff::Fixed)));
        queue.start().unwrap();
        queue.enqueue_relation(Scripted::new("stuck", usize::MAX, &journal));
        queue.enqueue_relation(Scripted::new("fine", 0, &journal));

        let report = queue.wait_until_settled(WAIT).unwrap();
        queue.shutdown();

        assert_eq!(report.wired, vec!["fine".to_owned()]);
        assert_eq!(report.stuck.len(), 1);
        assert_eq!(report.stuck[0].name, "stuck");
        assert_eq!(report.stuck[0].attempts, 3);
        assert_eq!(report.stuck[0].stage, Stage::Relation);
        let relate_stuck = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "relate:stuck")
            .count();
        assert_eq!(relate_stuck, 3);
    }

    #[test]
    fn failed_item_is_not_requeued() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeploymentQueue::new(ctx(), fast(RetryPolicy::unbounded()));
        queue.start().unwrap();
        let unit = Arc::new(Scripted {
            descriptor: ServiceUnitDescriptor::new("bad").unwrap(),
            journal: Arc::clone(&journal),
            retries_left: AtomicUsize::new(0),
            fail: true,
            post_fail: false,
        });
        queue.enqueue_setup(unit);

        let report = queue.wait_until_settled(WAIT).unwrap();
        queue.shutdown();
        assert_eq!(*journal.lock().unwrap(), vec!["setup:bad"]);
        assert_eq!(report.stuck[0].stage, Stage::Setup);
        assert_eq!(report.stuck[0].reason, "rejected");
    }

    #[test]
    fn backoff_does_not_block_other_items() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let policy = RetryPolicy::bounded(
            5,
            Backoff::Exponential {
                base_ms: 50,
                max_ms: 50,
            },
        );
        let mut queue = DeploymentQueue::new(ctx(), fast(policy));
        queue.enqueue_setup(Scripted::new("slow", 1, &journal));
        queue.enqueue_setup(Scripted::new("quick", 0, &journal));
        queue.start().unwrap();

        let report = queue.wait_until_settled(WAIT).unwrap();
        queue.shutdown();
        assert_eq!(report.deployed, vec!["quick".to_owned(), "slow".to_owned()]);
        // backed-off dequeues don't count as attempts
        let slow = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "setup:slow")
            .count();
        assert_eq!(slow, 2);
    }

    #[test]
    fn backlogs_are_independent() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeploymentQueue::new(ctx(), fast(RetryPolicy::unbounded()));
        queue.enqueue_setup(Scripted::new("s", 0, &journal));
        queue.enqueue_relation(Scripted::new("r", 0, &journal));
        assert_eq!(queue.pending(), (1, 1));
        queue.start().unwrap();

        let report = queue.wait_until_settled(WAIT).unwrap();
        assert_eq!(queue.pending(), (0, 0));
        assert_eq!(report.deployed, vec!["s".to_owned()]);
        assert_eq!(report.wired, vec!["r".to_owned()]);
        queue.shutdown();
    }

    #[test]
    fn start_twice_fails() {
        let mut queue = DeploymentQueue::new(ctx(), fast(RetryPolicy::unbounded()));
        queue.start().unwrap();
        assert!(matches!(queue.start(), Err(CoreError::QueueStarted)));
        queue.shutdown();
    }

    #[test]
    fn settle_times_out_while_stuck() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeploymentQueue::new(ctx(), fast(RetryPolicy::unbounded()));
        queue.start().unwrap();
        queue.enqueue_setup(Scripted::new("forever", usize::MAX, &journal));

        let err = queue
            .wait_until_settled(Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::QueueTimeout {
                setup: 1,
                relation: 0
            }
        ));
        queue.shutdown();
    }

    #[test]
    fn failed_post_process_is_stuck_not_wired() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeploymentQueue::new(ctx(), fast(RetryPolicy::unbounded()));
        queue.start().unwrap();
        queue.enqueue_relation(Arc::new(Scripted {
            descriptor: ServiceUnitDescriptor::new("glance").unwrap(),
            journal: Arc::clone(&journal),
            retries_left: AtomicUsize::new(0),
            fail: false,
            post_fail: true,
        }));
        queue.enqueue_relation(Scripted::new("mysql", 0, &journal));

        let report = queue.wait_until_settled(WAIT).unwrap();
        queue.shutdown();

        assert_eq!(report.wired, vec!["mysql".to_owned()]);
        assert_eq!(report.stuck.len(), 1);
        assert_eq!(report.stuck[0].name, "glance");
        assert_eq!(report.stuck[0].stage, Stage::PostProcess);
        assert!(report.stuck[0].reason.contains("disk full"));
        let posts = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "post:glance")
            .count();
        assert_eq!(posts, 1);
    }

    static STOP_SETTLE: AtomicBool = AtomicBool::new(false);

    #[test]
    fn interrupt_ends_settle_wait_and_workers() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeploymentQueue::new(ctx(), fast(RetryPolicy::unbounded()))
            .with_interrupt(|| STOP_SETTLE.load(Ordering::SeqCst));
        queue.start().unwrap();
        queue.enqueue_setup(Scripted::new("forever", usize::MAX, &journal));
        STOP_SETTLE.store(true, Ordering::SeqCst);

        let err = queue.wait_until_settled(None).unwrap_err();
        assert!(matches!(
            err,
            CoreError::QueueTimeout {
                setup: 1,
                relation: 0
            }
        ));
        // workers observe the same flag and exit, so this returns
        let report = queue.shutdown();
        assert!(report.deployed.is_empty());
    }

    #[test]
    fn pause_only_when_everything_is_deferred() {
        let now = Instant::now();
        let due = now + Duration::from_millis(40);
        let idle = Duration::from_millis(200);

        assert_eq!(deferral_pause(1, 2, due, now, idle), None);
        assert_eq!(
            deferral_pause(2, 2, due, now, idle),
            Some(Duration::from_millis(40))
        );
        assert_eq!(
            deferral_pause(1, 1, now + Duration::from_secs(5), now, idle),
            Some(idle)
        );
        assert_eq!(deferral_pause(1, 1, now, due, idle), Some(Duration::ZERO));
    }

    #[test]
    fn lone_backed_off_item_is_retried_after_its_delay() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let policy = RetryPolicy::bounded(
            3,
            Backoff::Exponential {
                base_ms: 80,
                max_ms: 80,
            },
        );
        let mut queue = DeploymentQueue::new(ctx(), fast(policy));
        queue.enqueue_setup(Scripted::new("slow", 1, &journal));
        let started = Instant::now();
        queue.start().unwrap();

        let report = queue.wait_until_settled(WAIT).unwrap();
        queue.shutdown();
        assert_eq!(report.deployed, vec!["slow".to_owned()]);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn report_survives_poisoned_lock() {
        let shared = Arc::new(Shared::default());
        let poisoner = Arc::clone(&shared);
        let joined = thread::spawn(move || poisoner.record(|_| panic!("worker died"))).join();
        assert!(joined.is_err());
        assert!(shared.report.is_poisoned());

        shared.record(|r| r.deployed.push("mysql".to_owned()));
        assert_eq!(shared.snapshot().deployed, vec!["mysql".to_owned()]);
    }
}
