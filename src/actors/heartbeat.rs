//! Generic heartbeat actor loop.
//!
//! A long-lived background task implements [`HeartbeatActor`] (its three
//! hooks) and is driven by [`spawn`], which owns the loop:
//!
//! ```text
//! pre_run ──ok──> ┌─> heartbeat_run ─> beat ─> sleep(interval) ─┐
//!    │            └──────────── while running ─────────────────┘
//!    └─err─> abort                        │
//!                                         ▼
//!                          post_run(exit) ─> beat ─> final heartbeat
//! ```
//!
//! `post_run` always runs exactly once, whether the loop ended because the
//! work was done, because somebody called [`ActorContext::abort`], or because
//! a hook returned an error or panicked. Failures are caught here, logged,
//! and handed to `post_run` as [`ActorExit::Failed`].
//!
//! Cancellation only flips a flag. It is observed at the next check, so an
//! in-flight wait completes before the actor notices.

use crate::clock::{Clock, Timestamp};
use crate::error::CaptureError;
use crate::messages::{Dispatcher, HeartbeatReport, Operation};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why the loop of an actor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorExit {
    /// The actor declared its work done (`abort(complete = true)`).
    Finished,
    /// Stopped by an external request (`abort(complete = false)`).
    Aborted,
    /// A hook failed or panicked.
    Failed(String),
}

/// How a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Work is naturally done.
    Finished,
    /// External request.
    Aborted,
}

/// Hooks of a heartbeat actor.
#[async_trait]
pub trait HeartbeatActor: Send + 'static {
    /// Setup before the loop. The default marks the actor ready.
    async fn pre_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
        ctx.set_ready();
        Ok(())
    }

    /// One unit of work, followed by a heartbeat and the interval sleep.
    async fn heartbeat_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError>;

    /// Teardown. Runs exactly once.
    async fn post_run(&mut self, _ctx: &ActorContext, _exit: &ActorExit) {}
}

#[derive(Debug)]
enum ActorName {
    Provisional(String),
    Final(String),
}

impl ActorName {
    fn as_str(&self) -> &str {
        match self {
            ActorName::Provisional(name) | ActorName::Final(name) => name,
        }
    }
}

struct ContextInner {
    name: Mutex<ActorName>,
    interval: Duration,
    running: AtomicBool,
    stop_reason: Mutex<Option<StopReason>>,
    ready: watch::Sender<bool>,
    heartbeat_count: AtomicU64,
    last_heartbeat: Mutex<Option<Timestamp>>,
    log_every: u64,
    clock: Clock,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Shared control block of one actor: name, flags and liveness counters.
///
/// Cloning is cheap; every clone refers to the same actor.
#[derive(Clone)]
pub struct ActorContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ActorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorContext")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .field("ready", &self.is_ready())
            .field("heartbeat_count", &self.heartbeat_count())
            .finish()
    }
}

impl ActorContext {
    /// Context for an actor whose name is already final.
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        clock: Clock,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self::build(ActorName::Final(name.into()), interval, clock, dispatcher)
    }

    /// Context for an actor that will learn its final name later (for
    /// example once storage assigns an id). The name can be set once.
    pub fn provisional(
        name: impl Into<String>,
        interval: Duration,
        clock: Clock,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self::build(
            ActorName::Provisional(name.into()),
            interval,
            clock,
            dispatcher,
        )
    }

    fn build(
        name: ActorName,
        interval: Duration,
        clock: Clock,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(ContextInner {
                name: Mutex::new(name),
                interval,
                running: AtomicBool::new(true),
                stop_reason: Mutex::new(None),
                ready,
                heartbeat_count: AtomicU64::new(0),
                last_heartbeat: Mutex::new(None),
                log_every: 50,
                clock,
                dispatcher,
            }),
        }
    }

    /// Current name.
    pub fn name(&self) -> String {
        self.inner.name.lock().as_str().to_string()
    }

    /// Replaces a provisional name. Names are immutable once final; later
    /// attempts are ignored with a warning.
    pub fn set_name(&self, new_name: impl Into<String>) -> bool {
        let new_name = new_name.into();
        let mut name = self.inner.name.lock();
        match &*name {
            ActorName::Provisional(_) => {
                debug!(from = name.as_str(), to = %new_name, "actor renamed");
                *name = ActorName::Final(new_name);
                true
            }
            ActorName::Final(current) => {
                warn!(
                    actor = %current,
                    rejected = %new_name,
                    "tried to rename actor; names are immutable once set"
                );
                false
            }
        }
    }

    /// Whether the loop should keep going.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// How the first stop was requested, if any.
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.inner.stop_reason.lock()
    }

    /// Requests a graceful stop. `complete` only changes the log severity
    /// and the recorded reason. Idempotent; the first reason wins.
    pub fn abort(&self, complete: bool) {
        self.inner.running.store(false, Ordering::Release);
        let mut reason = self.inner.stop_reason.lock();
        if reason.is_none() {
            if complete {
                *reason = Some(StopReason::Finished);
                info!(actor = %self.name(), "work complete, shutting down");
            } else {
                *reason = Some(StopReason::Aborted);
                warn!(actor = %self.name(), "aborted");
            }
        }
    }

    /// Shorthand for `abort(true)`.
    pub fn finish(&self) {
        self.abort(true);
    }

    /// Marks setup as done and wakes anyone waiting on readiness.
    pub fn set_ready(&self) {
        if !self.inner.ready.send_replace(true) {
            info!(actor = %self.name(), "ready");
        }
    }

    /// Whether setup has finished.
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Waits for readiness. Returns `false` on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.ready.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Heartbeat interval of the loop.
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Number of heartbeats emitted so far.
    pub fn heartbeat_count(&self) -> u64 {
        self.inner.heartbeat_count.load(Ordering::Acquire)
    }

    /// Time of the last heartbeat.
    pub fn last_heartbeat(&self) -> Option<Timestamp> {
        *self.inner.last_heartbeat.lock()
    }

    /// Clock shared with the rest of the core.
    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    /// Dispatcher the actor reports through.
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        Arc::clone(&self.inner.dispatcher)
    }

    /// Emits one heartbeat: bump the counter, stamp the time and forward the
    /// report to the registry.
    pub fn beat(&self) {
        let now = self.inner.clock.now();
        let count = {
            let mut last = self.inner.last_heartbeat.lock();
            *last = Some(now);
            self.inner.heartbeat_count.fetch_add(1, Ordering::AcqRel) + 1
        };
        if count % self.inner.log_every == 0 {
            debug!(actor = %self.name(), count, "heartbeat");
        }
        self.publish_heartbeat(false);
    }

    /// Sends the current liveness state. `is_final` evicts the registry entry.
    pub fn publish_heartbeat(&self, is_final: bool) {
        let report = HeartbeatReport {
            name: self.name(),
            timestamp: self.last_heartbeat(),
            count: self.heartbeat_count(),
            is_final,
        };
        self.inner.dispatcher.dispatch(Operation::Heartbeat(report));
    }
}

/// Running actor: its context plus the task driving the loop.
#[derive(Debug)]
pub struct ActorTask {
    ctx: ActorContext,
    handle: JoinHandle<()>,
}

impl ActorTask {
    /// Control block of the actor.
    pub fn context(&self) -> &ActorContext {
        &self.ctx
    }

    /// Whether the loop task has not yet returned.
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Waits for the loop, including teardown, to finish.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            error!(actor = %self.ctx.name(), error = %err, "actor task did not complete");
        }
    }
}

/// Starts `actor` on its own task.
pub fn spawn<A: HeartbeatActor>(actor: A, ctx: ActorContext) -> ActorTask {
    let handle = tokio::spawn(run(actor, ctx.clone()));
    ActorTask { ctx, handle }
}

async fn run<A: HeartbeatActor>(mut actor: A, ctx: ActorContext) {
    debug!(actor = %ctx.name(), "actor started");
    let mut failure = None;

    match AssertUnwindSafe(actor.pre_run(&ctx)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(actor = %ctx.name(), error = %err, "setup failed");
            failure = Some(err.to_string());
            ctx.abort(false);
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(actor = %ctx.name(), %reason, "setup panicked");
            failure = Some(reason);
            ctx.abort(false);
        }
    }

    while ctx.is_running() {
        match AssertUnwindSafe(actor.heartbeat_run(&ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(actor = %ctx.name(), error = %err, "heartbeat run failed");
                failure = Some(err.to_string());
                ctx.abort(false);
                break;
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(actor = %ctx.name(), %reason, "heartbeat run panicked");
                failure = Some(reason);
                ctx.abort(false);
                break;
            }
        }
        ctx.beat();
        if !ctx.is_running() {
            break;
        }
        tokio::time::sleep(ctx.interval()).await;
    }

    let exit = match failure {
        Some(reason) => ActorExit::Failed(reason),
        None => match ctx.stop_reason() {
            Some(StopReason::Aborted) => ActorExit::Aborted,
            _ => ActorExit::Finished,
        },
    };

    if let Err(panic) = AssertUnwindSafe(actor.post_run(&ctx, &exit))
        .catch_unwind()
        .await
    {
        error!(
            actor = %ctx.name(),
            reason = %panic_message(panic.as_ref()),
            "teardown panicked"
        );
    }

    ctx.beat();
    ctx.publish_heartbeat(true);
    debug!(actor = %ctx.name(), ?exit, "actor stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Sink {
        ops: Mutex<Vec<HeartbeatReport>>,
    }

    impl Dispatcher for Sink {
        fn dispatch(&self, op: Operation) {
            if let Operation::Heartbeat(report) = op {
                self.ops.lock().push(report);
            }
        }
    }

    struct Counter {
        ticks: Arc<AtomicUsize>,
        teardowns: Arc<AtomicUsize>,
        stop_after: usize,
        fail_setup: bool,
        panic_on: Option<usize>,
        exit: Arc<Mutex<Option<ActorExit>>>,
    }

    impl Counter {
        fn new(stop_after: usize) -> Self {
            Self {
                ticks: Arc::new(AtomicUsize::new(0)),
                teardowns: Arc::new(AtomicUsize::new(0)),
                stop_after,
                fail_setup: false,
                panic_on: None,
                exit: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl HeartbeatActor for Counter {
        async fn pre_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
            if self.fail_setup {
                return Err(CaptureError::QueueNotSet(Duration::from_secs(3)));
            }
            ctx.set_ready();
            Ok(())
        }

        async fn heartbeat_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on == Some(tick) {
                panic!("tick {tick} exploded");
            }
            if tick >= self.stop_after {
                ctx.finish();
            }
            Ok(())
        }

        async fn post_run(&mut self, _ctx: &ActorContext, exit: &ActorExit) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            *self.exit.lock() = Some(exit.clone());
        }
    }

    fn context(sink: &Arc<Sink>) -> ActorContext {
        ActorContext::new(
            "counter",
            Duration::from_millis(100),
            Clock::system(),
            Arc::clone(sink) as Arc<dyn Dispatcher>,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_until_finished_then_tears_down_once() {
        let sink = Arc::new(Sink::default());
        let actor = Counter::new(3);
        let (ticks, teardowns, exit) = (
            actor.ticks.clone(),
            actor.teardowns.clone(),
            actor.exit.clone(),
        );

        let task = spawn(actor, context(&sink));
        assert!(task.context().wait_ready(Duration::from_secs(1)).await);
        task.join().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(*exit.lock(), Some(ActorExit::Finished));

        let reports = sink.ops.lock();
        let last = reports.last().unwrap();
        assert!(last.is_final);
        // three loop beats plus the teardown beat
        assert_eq!(last.count, 4);
        assert_eq!(reports.iter().filter(|r| r.is_final).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn external_abort_is_reported_as_aborted() {
        let sink = Arc::new(Sink::default());
        let actor = Counter::new(usize::MAX);
        let exit = actor.exit.clone();

        let task = spawn(actor, context(&sink));
        tokio::time::sleep(Duration::from_millis(350)).await;
        task.context().abort(false);
        task.context().abort(true);
        let ctx = task.context().clone();
        task.join().await;

        assert_eq!(*exit.lock(), Some(ActorExit::Aborted));
        assert_eq!(ctx.stop_reason(), Some(StopReason::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_setup_skips_loop_but_runs_teardown() {
        let sink = Arc::new(Sink::default());
        let mut actor = Counter::new(5);
        actor.fail_setup = true;
        let (ticks, teardowns, exit) = (
            actor.ticks.clone(),
            actor.teardowns.clone(),
            actor.exit.clone(),
        );

        spawn(actor, context(&sink)).join().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(matches!(&*exit.lock(), Some(ActorExit::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_hook_is_caught() {
        let sink = Arc::new(Sink::default());
        let mut actor = Counter::new(10);
        actor.panic_on = Some(2);
        let (teardowns, exit) = (actor.teardowns.clone(), actor.exit.clone());

        spawn(actor, context(&sink)).join().await;

        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        let exit = exit.lock().clone();
        match exit {
            Some(ActorExit::Failed(reason)) => assert!(reason.contains("tick 2 exploded")),
            other => panic!("unexpected exit: {other:?}"),
        };
    }

    #[test]
    fn provisional_name_can_be_set_exactly_once() {
        let sink = Arc::new(Sink::default());
        let ctx = ActorContext::provisional(
            "XP_1_CJR_pending_id",
            Duration::from_millis(100),
            Clock::system(),
            sink as Arc<dyn Dispatcher>,
        );
        assert!(ctx.set_name("XP_1_CJR_7"));
        assert!(!ctx.set_name("XP_1_CJR_8"));
        assert_eq!(ctx.name(), "XP_1_CJR_7");
    }

    #[test]
    #[traced_test]
    fn final_name_cannot_change() {
        let sink = Arc::new(Sink::default());
        let ctx = context(&sink);
        assert!(!ctx.set_name("other"));
        assert_eq!(ctx.name(), "counter");
        assert!(logs_contain("names are immutable once set"));
    }
}
