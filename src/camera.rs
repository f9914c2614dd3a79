//! Camera actor.
//!
//! [`CaptureThread`] is the only owner of the camera device. Capture requests
//! wait in a min-heap keyed by their requested timestamp (arrival order
//! breaks ties). On every tick the earliest request is armed once it is due
//! within the lead window; the thread then waits for exactly that instant,
//! captures and hands the image to storage.
//!
//! The device is opened while requests are pending and closed as soon as the
//! queue is empty. A thread that has had nothing to do for `idle_grace`
//! retires on its own; [`CameraService`] transparently starts a fresh one for
//! the next request.

use crate::actors::{self, ActorContext, ActorExit, ActorTask, HeartbeatActor, StopReason};
use crate::clock::{Clock, Timestamp};
use crate::config::CameraConfig;
use crate::error::{AppResult, CaptureError};
use crate::hardware::CameraDevice;
use crate::messages::{CaptureMetadata, CaptureRequest, CapturedImage, Dispatcher};
use crate::proxy::StorageProxy;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const CAPTURE_THREAD_NAME: &str = "capture_thread";

struct QueuedRequest {
    request: CaptureRequest,
    seq: u64,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .requested_timestamp
            .total_cmp(&other.request.requested_timestamp)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct CaptureQueue {
    heap: BinaryHeap<Reverse<QueuedRequest>>,
    accepting: bool,
    next_seq: u64,
}

enum NextCapture {
    Idle,
    Waiting(Timestamp),
    Due(CaptureRequest),
}

/// Handle to a running capture thread.
pub struct CaptureThread {
    queue: Arc<Mutex<CaptureQueue>>,
    task: ActorTask,
}

impl CaptureThread {
    /// Starts a capture thread owning `camera`.
    pub fn spawn(
        camera: Arc<dyn CameraDevice>,
        config: CameraConfig,
        clock: Clock,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let queue = Arc::new(Mutex::new(CaptureQueue {
            accepting: true,
            ..CaptureQueue::default()
        }));
        let ctx = ActorContext::new(
            CAPTURE_THREAD_NAME,
            config.tick,
            clock,
            Arc::clone(&dispatcher),
        );
        let actor = CaptureThreadActor {
            camera,
            queue: Arc::clone(&queue),
            config,
            clock,
            storage: StorageProxy::new(dispatcher),
            idle_since: None,
        };
        Self {
            queue,
            task: actors::spawn(actor, ctx),
        }
    }

    /// Enqueues a request. A thread that is stopping or has retired hands
    /// the request back.
    pub fn push_capture_request(&self, request: CaptureRequest) -> Result<(), CaptureRequest> {
        let mut queue = self.queue.lock();
        if !queue.accepting {
            return Err(request);
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        debug!(at = %request.requested_timestamp, pending = queue.heap.len() + 1, "capture request queued");
        queue.heap.push(Reverse(QueuedRequest { request, seq }));
        Ok(())
    }

    /// Stops the thread. `complete = false` also drops every pending request.
    /// Later pushes are refused. Idempotent.
    pub fn abort(&self, complete: bool) {
        {
            let mut queue = self.queue.lock();
            queue.accepting = false;
            if !complete && !queue.heap.is_empty() {
                warn!(dropped = queue.heap.len(), "dropping pending capture requests");
                queue.heap.clear();
            }
        }
        self.task.context().abort(complete);
    }

    /// Number of pending requests.
    pub fn pending(&self) -> usize {
        self.queue.lock().heap.len()
    }

    /// Whether the thread still takes requests.
    pub fn is_accepting(&self) -> bool {
        self.queue.lock().accepting
    }

    /// Whether the loop is still running (including teardown).
    pub fn is_alive(&self) -> bool {
        self.task.is_alive()
    }

    /// Liveness control block.
    pub fn context(&self) -> &ActorContext {
        self.task.context()
    }

    /// Waits for the thread to finish.
    pub async fn join(self) {
        self.task.join().await;
    }
}

struct CaptureThreadActor {
    camera: Arc<dyn CameraDevice>,
    queue: Arc<Mutex<CaptureQueue>>,
    config: CameraConfig,
    clock: Clock,
    storage: StorageProxy,
    idle_since: Option<Timestamp>,
}

impl CaptureThreadActor {
    fn next_capture(&self, now: Timestamp) -> NextCapture {
        let lead = self.config.lead_window().as_secs_f64();
        let mut queue = self.queue.lock();
        let due_at = match queue.heap.peek() {
            None => return NextCapture::Idle,
            Some(Reverse(head)) => head.request.requested_timestamp,
        };
        if due_at.seconds_since(now) > lead {
            return NextCapture::Waiting(due_at);
        }
        match queue.heap.pop() {
            Some(Reverse(head)) => NextCapture::Due(head.request),
            None => NextCapture::Idle,
        }
    }

    async fn ensure_open(&self, ctx: &ActorContext) {
        if self.camera.is_open() {
            return;
        }
        match self.camera.open().await {
            Ok(()) => {
                let (width, height) = self.camera.resolution();
                let rotation = self.camera.rotation();
                info!(actor = %ctx.name(), width, height, rotation, "camera opened");
            }
            Err(err) => error!(actor = %ctx.name(), error = %err, "failed to open camera"),
        }
    }

    async fn release(&self, ctx: &ActorContext) {
        if !self.camera.is_open() {
            return;
        }
        match self.camera.close().await {
            Ok(()) => debug!(actor = %ctx.name(), "camera released"),
            Err(err) => error!(actor = %ctx.name(), error = %err, "failed to release camera"),
        }
    }

    async fn capture(&self, ctx: &ActorContext, request: CaptureRequest) {
        self.ensure_open(ctx).await;
        self.clock.sleep_until(request.requested_timestamp).await;
        match self.camera.capture().await {
            Ok(frame) => {
                let lag = frame.captured_at.seconds_since(request.requested_timestamp);
                debug!(
                    actor = %ctx.name(),
                    requested = %request.requested_timestamp,
                    lag_ms = (lag * 1e3).round(),
                    "captured"
                );
                self.storage.report_captured_image(CapturedImage {
                    data: frame.data,
                    requested_timestamp: request.requested_timestamp,
                    capture_timestamp: frame.captured_at,
                    rotation: frame.rotation,
                    meta: request.meta,
                });
            }
            Err(err) => error!(
                actor = %ctx.name(),
                requested = %request.requested_timestamp,
                error = %err,
                "capture failed"
            ),
        }
    }
}

#[async_trait]
impl HeartbeatActor for CaptureThreadActor {
    async fn heartbeat_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
        let now = self.clock.now();
        match self.next_capture(now) {
            NextCapture::Due(request) => {
                self.idle_since = None;
                self.capture(ctx, request).await;
            }
            NextCapture::Waiting(due_at) => {
                self.idle_since = None;
                self.ensure_open(ctx).await;
                trace!(actor = %ctx.name(), due = %due_at, "next capture pending");
            }
            NextCapture::Idle => {
                self.release(ctx).await;
                let idle_since = *self.idle_since.get_or_insert(now);
                if now.seconds_since(idle_since) >= self.config.idle_grace.as_secs_f64() {
                    let mut queue = self.queue.lock();
                    if queue.heap.is_empty() {
                        queue.accepting = false;
                        drop(queue);
                        debug!(actor = %ctx.name(), "idle, retiring");
                        ctx.finish();
                    }
                }
            }
        }
        Ok(())
    }

    async fn post_run(&mut self, ctx: &ActorContext, exit: &ActorExit) {
        let dropped = {
            let mut queue = self.queue.lock();
            queue.accepting = false;
            let dropped = queue.heap.len();
            queue.heap.clear();
            dropped
        };
        if dropped > 0 {
            warn!(actor = %ctx.name(), dropped, ?exit, "capture thread stopped with pending requests");
        }
        self.release(ctx).await;
    }
}

/// Long-lived camera entry point used by the router.
///
/// Starts a capture thread on demand and replaces it once it has retired.
/// While an explicitly aborted thread is still draining, new requests are
/// dropped.
pub struct CameraService {
    device: Arc<dyn CameraDevice>,
    config: CameraConfig,
    clock: Clock,
    dispatcher: Arc<dyn Dispatcher>,
    thread: tokio::sync::Mutex<Option<CaptureThread>>,
}

impl CameraService {
    /// Creates the service. No thread is started yet.
    pub fn new(
        device: Arc<dyn CameraDevice>,
        config: CameraConfig,
        clock: Clock,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            device,
            config,
            clock,
            dispatcher,
            thread: tokio::sync::Mutex::new(None),
        }
    }

    /// Makes sure a capture thread is running.
    pub async fn start(&self) -> AppResult<()> {
        let mut slot = self.thread.lock().await;
        self.live_thread(&mut slot).await.map(|_| ())
    }

    /// Hands a request to the capture thread.
    pub async fn queue_capture_request(&self, request: CaptureRequest) -> AppResult<()> {
        let mut slot = self.thread.lock().await;
        let aborting = slot.as_ref().is_some_and(|thread| {
            thread.is_alive() && thread.context().stop_reason() == Some(StopReason::Aborted)
        });
        if aborting {
            warn!(at = %request.requested_timestamp, "camera is aborting, dropping capture request");
            return Ok(());
        }

        let mut request = request;
        for _ in 0..2 {
            let thread = self.live_thread(&mut slot).await?;
            match thread.push_capture_request(request) {
                Ok(()) => return Ok(()),
                Err(rejected) => request = rejected,
            }
        }
        warn!(at = %request.requested_timestamp, "capture thread refused request, dropping it");
        Ok(())
    }

    /// Captures a calibration image right away. It is not attributed to any
    /// job record.
    pub async fn capture_calibration_image(&self, xp_id: i64, species: &str) -> AppResult<()> {
        info!(xp_id, species, "calibration capture requested");
        self.queue_capture_request(CaptureRequest {
            requested_timestamp: self.clock.now(),
            meta: CaptureMetadata {
                xp_id,
                cjr_id: None,
                species: species.to_string(),
                voltage: 0.0,
                current: 0.0,
                is_cal_image: true,
            },
        })
        .await
    }

    /// Stops the capture thread. Without `force` it only stops when no
    /// requests are pending. Returns whether a stop was issued.
    pub async fn stop(&self, force: bool) -> bool {
        let slot = self.thread.lock().await;
        match slot.as_ref() {
            Some(thread) if thread.is_alive() => {
                if force {
                    thread.abort(false);
                    true
                } else if thread.pending() == 0 {
                    thread.abort(true);
                    true
                } else {
                    info!(pending = thread.pending(), "capture thread busy, not stopping");
                    false
                }
            }
            _ => false,
        }
    }

    /// Cancels all outstanding camera work.
    pub async fn abort(&self) {
        if let Some(thread) = self.thread.lock().await.as_ref() {
            thread.abort(false);
        }
    }

    /// Pending requests of the current thread.
    pub async fn pending(&self) -> usize {
        self.thread
            .lock()
            .await
            .as_ref()
            .map_or(0, CaptureThread::pending)
    }

    /// Whether a capture thread is alive.
    pub async fn is_running(&self) -> bool {
        self.thread
            .lock()
            .await
            .as_ref()
            .is_some_and(CaptureThread::is_alive)
    }

    /// Aborts the thread and waits for it to release the camera.
    pub async fn shutdown(&self) {
        let thread = self.thread.lock().await.take();
        if let Some(thread) = thread {
            thread.abort(false);
            thread.join().await;
        }
    }

    async fn live_thread<'a>(
        &self,
        slot: &'a mut Option<CaptureThread>,
    ) -> AppResult<&'a CaptureThread> {
        let usable = slot
            .as_ref()
            .is_some_and(|thread| thread.is_alive() && thread.is_accepting());
        if !usable {
            if let Some(old) = slot.take() {
                debug!("replacing retired capture thread");
                old.join().await;
            }
            let thread = CaptureThread::spawn(
                Arc::clone(&self.device),
                self.config,
                self.clock,
                Arc::clone(&self.dispatcher),
            );
            if !thread.context().wait_ready(self.config.ready_timeout).await {
                thread.abort(false);
                return Err(CaptureError::ReadyTimeout {
                    name: thread.context().name(),
                    timeout: self.config.ready_timeout,
                });
            }
            *slot = Some(thread);
        }
        slot.as_ref().ok_or_else(|| CaptureError::ActorFailed {
            name: CAPTURE_THREAD_NAME.to_string(),
            reason: "capture thread missing after start".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockCamera;
    use crate::messages::Operation;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Images(Mutex<Vec<CapturedImage>>);

    impl Dispatcher for Images {
        fn dispatch(&self, op: Operation) {
            if let Operation::ReportCapturedImage(image) = op {
                self.0.lock().push(image);
            }
        }
    }

    fn meta() -> CaptureMetadata {
        CaptureMetadata {
            xp_id: 1,
            cjr_id: Some(7),
            species: "HP".to_string(),
            voltage: 5.0,
            current: 1.0,
            is_cal_image: false,
        }
    }

    fn request(at: Timestamp) -> CaptureRequest {
        CaptureRequest {
            requested_timestamp: at,
            meta: meta(),
        }
    }

    fn setup() -> (Clock, Arc<MockCamera>, Arc<Images>, CameraService) {
        let clock = Clock::anchored_at(Timestamp::from_secs(1_000.0));
        let camera = Arc::new(MockCamera::new(clock, 64, 48).with_rotation(180));
        let images = Arc::new(Images::default());
        let service = CameraService::new(
            Arc::clone(&camera) as Arc<dyn CameraDevice>,
            CameraConfig::default(),
            clock,
            Arc::clone(&images) as Arc<dyn Dispatcher>,
        );
        (clock, camera, images, service)
    }

    #[tokio::test(start_paused = true)]
    async fn captures_fire_in_timestamp_order_at_the_requested_instant() {
        let (clock, camera, images, service) = setup();
        let base = clock.now();
        for offset in [4.0, 2.0, 3.0] {
            service.queue_capture_request(request(base + offset)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_secs(6)).await;

        let images = images.0.lock();
        let requested: Vec<f64> = images
            .iter()
            .map(|image| image.requested_timestamp.seconds_since(base))
            .collect();
        assert_eq!(requested, vec![2.0, 3.0, 4.0]);
        for image in images.iter() {
            let lag = image.capture_timestamp.seconds_since(image.requested_timestamp);
            assert!((0.0..0.05).contains(&lag), "capture lag {lag}");
        }
        assert_eq!(camera.frame_count(), 3);
        assert!(!camera.is_open(), "camera must be released once idle");
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn camera_is_opened_ahead_of_a_pending_capture() {
        let (clock, camera, images, service) = setup();
        service.queue_capture_request(request(clock.now() + 3.0)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(camera.is_open());
        assert!(images.0.lock().is_empty());
        assert!(logs_contain("next capture pending"));
        assert!(logs_contain("rotation=180"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(images.0.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_thread_retires_and_is_replaced() {
        let (clock, _camera, images, service) = setup();
        service.queue_capture_request(request(clock.now() + 1.0)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(!service.is_running().await, "thread should retire after idle grace");

        service.queue_capture_request(request(clock.now() + 1.0)).await.unwrap();
        assert!(service.is_running().await);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(images.0.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_drops_pending_and_refuses_new_requests() {
        let (clock, camera, images, service) = setup();
        service.queue_capture_request(request(clock.now() + 5.0)).await.unwrap();
        service.queue_capture_request(request(clock.now() + 6.0)).await.unwrap();
        assert_eq!(service.pending().await, 2);

        service.abort().await;
        service.queue_capture_request(request(clock.now() + 7.0)).await.unwrap();
        assert_eq!(service.pending().await, 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(images.0.lock().is_empty());
        assert!(!camera.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_force_waits_for_idle() {
        let (clock, _camera, _images, service) = setup();
        service.queue_capture_request(request(clock.now() + 5.0)).await.unwrap();
        assert!(!service.stop(false).await);
        assert!(service.stop(true).await);
        service.shutdown().await;
        assert!(!service.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_image_is_captured_immediately() {
        let (_clock, _camera, images, service) = setup();
        service.capture_calibration_image(3, "HP").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let images = images.0.lock();
        assert_eq!(images.len(), 1);
        assert!(images[0].meta.is_cal_image);
        assert_eq!(images[0].meta.cjr_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn device_errors_are_not_retried() {
        let (clock, camera, images, service) = setup();
        camera.set_failing(true);
        service.queue_capture_request(request(clock.now() + 1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(images.0.lock().is_empty());
        assert_eq!(service.pending().await, 0);
    }
}
