//! Worker subprocess lifecycle and request/response correlation.
//!
//! The coordinator owns exactly one worker subprocess. Jobs are framed onto
//! the worker's stdin with a fresh correlation id and resolved when the
//! matching response comes back on its stdout; responses may arrive in any
//! order relative to submission. A per-request deadline bounds each caller's
//! wait, and a background dispatch task turns an unexpected worker exit into
//! immediate rejection of everything in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::core::{CompressionJob, CompressionOutcome};
use crate::ipc::{Envelope, FrameReceiver, FrameSender};
use crate::utils::{CompressorError, CompressorResult};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle state of the worker subprocess.
///
/// Transitions only move forward: Uninitialized → Starting → Ready →
/// Terminated, with Starting → Failed on a handshake failure and
/// Ready → Failed on an unexpected exit. There is no restart path; a host
/// that wants a fresh worker constructs a fresh coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Starting,
    Ready,
    Failed,
    Terminated,
}

/// How to launch and talk to the worker subprocess.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executable to spawn
    pub program: PathBuf,
    /// Arguments selecting worker mode
    pub args: Vec<String>,
    /// How long to wait for the `ready` sentinel after spawning
    pub handshake_timeout: Duration,
    /// Per-request response deadline
    pub request_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["--worker".into()],
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Re-invokes the current executable in `--worker` mode.
    pub fn current_exe() -> CompressorResult<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            CompressorError::initialization(format!("could not locate current executable: {e}"))
        })?;
        Ok(Self::new(exe))
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct PendingRequest {
    resolver: oneshot::Sender<CompressorResult<CompressionOutcome>>,
    deadline: Instant,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<WorkerState>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    sender: Mutex<Option<FrameSender<BoxedWriter>>>,
    child: Mutex<Option<Child>>,
}

/// Handle to the worker subprocess and its in-flight requests.
#[derive(Debug)]
pub struct Coordinator {
    shared: Arc<Shared>,
    request_timeout: Duration,
}

impl Coordinator {
    /// Spawns the worker subprocess and completes the ready handshake.
    ///
    /// Blocks until the worker signals `ready` or `config.handshake_timeout`
    /// elapses; a timeout or spawn failure is fatal and leaves no usable
    /// coordinator behind.
    pub async fn spawn(config: WorkerConfig) -> CompressorResult<Self> {
        debug!(
            "spawning worker: {} {:?}",
            config.program.display(),
            config.args
        );
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CompressorError::initialization(format!(
                    "failed to spawn worker {}: {e}",
                    config.program.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CompressorError::initialization("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CompressorError::initialization("worker stdout was not captured"))?;

        Self::connect(
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
            config.handshake_timeout,
            config.request_timeout,
        )
        .await
    }

    /// Attaches to an already-established channel and performs the handshake.
    ///
    /// The transport endpoints are handed over at spawn time; tests connect
    /// both ends of an in-memory duplex here instead of a real subprocess.
    pub(crate) async fn connect(
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
        handshake_timeout: Duration,
        request_timeout: Duration,
    ) -> CompressorResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState::Starting),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sender: Mutex::new(Some(FrameSender::new(writer))),
            child: Mutex::new(child),
        });

        let mut receiver = FrameReceiver::new(reader);
        match timeout(handshake_timeout, receiver.recv()).await {
            Ok(Ok(Some(Envelope::Ready))) => {}
            Ok(Ok(Some(other))) => {
                Self::abort_startup(&shared).await;
                return Err(CompressorError::initialization(format!(
                    "unexpected {} envelope before ready",
                    other.kind()
                )));
            }
            Ok(Ok(None)) => {
                Self::abort_startup(&shared).await;
                return Err(CompressorError::initialization(
                    "worker closed the channel before signalling ready",
                ));
            }
            Ok(Err(e)) => {
                Self::abort_startup(&shared).await;
                return Err(CompressorError::initialization(format!(
                    "worker handshake failed: {e}"
                )));
            }
            Err(_) => {
                Self::abort_startup(&shared).await;
                return Err(CompressorError::initialization(format!(
                    "worker handshake timed out after {handshake_timeout:?}"
                )));
            }
        }

        *shared.state.lock().await = WorkerState::Ready;
        info!("worker ready, accepting submissions");
        tokio::spawn(Self::dispatch_loop(shared.clone(), receiver));

        Ok(Self {
            shared,
            request_timeout,
        })
    }

    /// Submits a job and waits for its response.
    ///
    /// Allowed only while the worker is `Ready`. Resolves with the matching
    /// response or fails with `RequestTimeout` once the deadline elapses; a
    /// timed-out request's entry is dropped and its eventual late response,
    /// if any, is discarded at dispatch. No cancellation is sent to the
    /// worker, which may still finish the stale job.
    pub async fn submit(&self, job: CompressionJob) -> CompressorResult<CompressionOutcome> {
        {
            let state = self.shared.state.lock().await;
            match *state {
                WorkerState::Ready => {}
                WorkerState::Terminated => return Err(CompressorError::Shutdown),
                other => {
                    return Err(CompressorError::state(format!(
                        "worker is {other:?}, not Ready"
                    )));
                }
            }
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        let deadline = Instant::now() + self.request_timeout;
        self.shared.pending.lock().await.insert(
            id,
            PendingRequest {
                resolver: tx,
                deadline,
            },
        );
        debug!("submitting request {} ({})", id, job.filename);

        {
            let mut sender = self.shared.sender.lock().await;
            let Some(sender) = sender.as_mut() else {
                // shutdown raced the state check
                self.shared.pending.lock().await.remove(&id);
                return Err(CompressorError::Shutdown);
            };
            if let Err(e) = sender.send(&Envelope::Request { id, job }).await {
                self.shared.pending.lock().await.remove(&id);
                return Err(e);
            }
        }

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        tokio::select! {
            result = &mut rx => match result {
                Ok(result) => result,
                Err(_) => Err(CompressorError::worker_crash("response channel closed")),
            },
            _ = &mut sleep => {
                // the deadline and a response can race; whoever removes the
                // entry settles the request, exactly once
                let removed = self.shared.pending.lock().await.remove(&id);
                match removed {
                    Some(_) => {
                        warn!(
                            "request {} timed out after {:?}",
                            id, self.request_timeout
                        );
                        Err(CompressorError::RequestTimeout(self.request_timeout))
                    }
                    None => match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(CompressorError::worker_crash("response channel closed")),
                    },
                }
            }
        }
    }

    /// Rejects everything in flight, closes the channel, and kills the
    /// worker. Safe to call more than once; `submit` afterwards fails with
    /// `Shutdown` immediately.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().await;
            if *state == WorkerState::Terminated {
                return;
            }
            *state = WorkerState::Terminated;
        }

        let drained: Vec<(u64, PendingRequest)> =
            self.shared.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            info!("rejecting {} pending requests on shutdown", drained.len());
        }
        for (_, pending) in drained {
            let _ = pending.resolver.send(Err(CompressorError::Shutdown));
        }

        // dropping the sender closes the worker's stdin
        self.shared.sender.lock().await.take();

        if let Some(mut child) = self.shared.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("worker kill failed (already exited?): {}", e);
            }
        }
        info!("coordinator terminated");
    }

    pub async fn state(&self) -> WorkerState {
        *self.shared.state.lock().await
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    async fn abort_startup(shared: &Shared) {
        *shared.state.lock().await = WorkerState::Failed;
        if let Some(mut child) = shared.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("worker kill failed during aborted startup: {}", e);
            }
        }
    }

    /// Turns an unexpected worker exit into immediate rejection of
    /// everything in flight. A no-op if the coordinator was already shut
    /// down, since `Terminated` already rejected everything.
    async fn handle_disconnect(shared: &Shared) {
        {
            let mut state = shared.state.lock().await;
            if *state == WorkerState::Terminated {
                return;
            }
            *state = WorkerState::Failed;
        }

        let drained: Vec<(u64, PendingRequest)> = shared.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            warn!(
                "worker disconnected with {} requests outstanding",
                drained.len()
            );
        }
        for (_, pending) in drained {
            let _ = pending
                .resolver
                .send(Err(CompressorError::worker_crash("worker disconnected")));
        }
    }

    async fn dispatch_loop(shared: Arc<Shared>, mut receiver: FrameReceiver<BoxedReader>) {
        loop {
            match receiver.recv().await {
                Ok(Some(envelope)) => Self::dispatch(&shared, envelope).await,
                Ok(None) => {
                    debug!("worker channel closed");
                    break;
                }
                Err(CompressorError::Serialization(msg)) => {
                    warn!("discarding malformed frame from worker: {}", msg);
                }
                Err(e) => {
                    warn!("worker channel read failed: {}", e);
                    break;
                }
            }
        }
        Self::handle_disconnect(&shared).await;
    }

    async fn dispatch(shared: &Shared, envelope: Envelope) {
        match envelope {
            Envelope::Success { id, outcome } => {
                Self::resolve(shared, id, Ok(outcome)).await;
            }
            Envelope::Error {
                id: Some(id),
                message,
            } => {
                Self::resolve(shared, id, Err(CompressorError::compression(message))).await;
            }
            Envelope::Error { id: None, message } => {
                warn!("worker reported an uncorrelated error: {}", message);
            }
            other => {
                warn!("ignoring unexpected {} envelope from worker", other.kind());
            }
        }
    }

    async fn resolve(shared: &Shared, id: u64, result: CompressorResult<CompressionOutcome>) {
        let entry = shared.pending.lock().await.remove(&id);
        match entry {
            Some(pending) => {
                if Instant::now() > pending.deadline {
                    debug!("request {} resolved past its deadline", id);
                }
                let _ = pending.resolver.send(result);
            }
            None => {
                warn!("discarding response for unknown or expired request {}", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    use crate::core::{CompressionOptions, ToolResult, compression_ratio};
    use crate::engine::Engine;
    use crate::engine::testing::FixedTool;
    use crate::worker;

    fn job(image: Vec<u8>, filename: &str) -> CompressionJob {
        CompressionJob {
            image,
            filename: filename.into(),
            options: CompressionOptions::default(),
        }
    }

    fn mock_outcome(job: &CompressionJob) -> CompressionOutcome {
        let original_size = job.image.len() as u64;
        let compressed = job.image.clone();
        let ratio = compression_ratio(original_size, compressed.len() as u64);
        CompressionOutcome {
            best_tool: "mock".into(),
            compression_ratio: ratio,
            total_duration_ms: 1,
            all_results: vec![ToolResult {
                tool: "mock".into(),
                original_size,
                compressed_size: compressed.len() as u64,
                compression_ratio: ratio,
                duration_ms: 1,
            }],
            compressed,
        }
    }

    /// Coordinator wired to a real worker loop over an in-memory duplex.
    async fn coordinator_with_engine(engine: Engine, request_timeout: Duration) -> Coordinator {
        let (host, remote) = duplex(1 << 20);
        let (host_read, host_write) = split(host);
        let (remote_read, remote_write) = split(remote);
        tokio::spawn(async move {
            let _ = worker::serve(remote_read, remote_write, engine).await;
        });
        Coordinator::connect(
            Box::new(host_read),
            Box::new(host_write),
            None,
            Duration::from_secs(5),
            request_timeout,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn submit_resolves_with_the_workers_response() {
        let engine = Engine::with_default_tools();
        let coordinator = coordinator_with_engine(engine, Duration::from_secs(5)).await;

        let outcome = coordinator
            .submit(job(vec![42; 64], "a.png"))
            .await
            .unwrap();
        assert_eq!(outcome.best_tool, "store");
        assert_eq!(outcome.compressed, vec![42; 64]);
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_submissions_resolve_to_their_own_responses() {
        // the store tool echoes the input, so each caller can recognize its
        // own payload coming back
        let engine = Engine::with_default_tools();
        let coordinator =
            Arc::new(coordinator_with_engine(engine, Duration::from_secs(5)).await);

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                let payload = vec![i; 32 + i as usize];
                let outcome = coordinator
                    .submit(job(payload.clone(), &format!("img-{i}.png")))
                    .await
                    .unwrap();
                (payload, outcome)
            }));
        }

        for handle in handles {
            let (payload, outcome) = handle.await.unwrap();
            assert_eq!(outcome.compressed, payload);
        }
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_match_by_correlation_id() {
        // scripted worker: collect both requests, answer them in reverse
        let (host, remote) = duplex(1 << 16);
        let (host_read, host_write) = split(host);
        let (remote_read, remote_write) = split(remote);
        tokio::spawn(async move {
            let mut tx = FrameSender::new(remote_write);
            let mut rx = FrameReceiver::new(remote_read);
            tx.send(&Envelope::Ready).await.unwrap();

            let mut requests = Vec::new();
            for _ in 0..2 {
                match rx.recv().await.unwrap() {
                    Some(Envelope::Request { id, job }) => requests.push((id, job)),
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
            for (id, job) in requests.into_iter().rev() {
                tx.send(&Envelope::Success {
                    id,
                    outcome: mock_outcome(&job),
                })
                .await
                .unwrap();
            }
            // keep the channel open so the coordinator does not see a crash
            std::future::pending::<()>().await;
        });

        let coordinator = Coordinator::connect(
            Box::new(host_read),
            Box::new(host_write),
            None,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let (first, second) = tokio::join!(
            coordinator.submit(job(vec![1; 10], "first.png")),
            coordinator.submit(job(vec![2; 20], "second.png")),
        );
        assert_eq!(first.unwrap().compressed, vec![1; 10]);
        assert_eq!(second.unwrap().compressed, vec![2; 20]);
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_request_leaves_no_pending_entry() {
        // scripted worker that acknowledges nothing
        let (host, remote) = duplex(1 << 16);
        let (host_read, host_write) = split(host);
        let (remote_read, remote_write) = split(remote);
        tokio::spawn(async move {
            let mut tx = FrameSender::new(remote_write);
            let mut rx = FrameReceiver::new(remote_read);
            tx.send(&Envelope::Ready).await.unwrap();
            while let Ok(Some(_)) = rx.recv().await {}
        });

        let coordinator = Coordinator::connect(
            Box::new(host_read),
            Box::new(host_write),
            None,
            Duration::from_secs(5),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let err = coordinator
            .submit(job(vec![0; 8], "slow.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompressorError::RequestTimeout(_)));
        assert_eq!(coordinator.pending_count().await, 0);
        assert_eq!(coordinator.state().await, WorkerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_discarded_and_worker_stays_usable() {
        let (host, remote) = duplex(1 << 16);
        let (host_read, host_write) = split(host);
        let (remote_read, remote_write) = split(remote);
        tokio::spawn(async move {
            let mut tx = FrameSender::new(remote_write);
            let mut rx = FrameReceiver::new(remote_read);
            tx.send(&Envelope::Ready).await.unwrap();

            // first response arrives 50ms past the caller's 100ms deadline
            let (stale_id, stale_job) = match rx.recv().await.unwrap() {
                Some(Envelope::Request { id, job }) => (id, job),
                other => panic!("unexpected frame: {other:?}"),
            };
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.send(&Envelope::Success {
                id: stale_id,
                outcome: mock_outcome(&stale_job),
            })
            .await
            .unwrap();

            // later requests are served promptly
            while let Ok(Some(Envelope::Request { id, job })) = rx.recv().await {
                tx.send(&Envelope::Success {
                    id,
                    outcome: mock_outcome(&job),
                })
                .await
                .unwrap();
            }
        });

        let coordinator = Coordinator::connect(
            Box::new(host_read),
            Box::new(host_write),
            None,
            Duration::from_secs(5),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let err = coordinator
            .submit(job(vec![9; 16], "stale.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompressorError::RequestTimeout(_)));

        let outcome = coordinator
            .submit(job(vec![3; 24], "fresh.png"))
            .await
            .unwrap();
        assert_eq!(outcome.compressed, vec![3; 24]);
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_is_an_initialization_error() {
        let (host, remote) = duplex(1 << 10);
        let (host_read, host_write) = split(host);
        // peer never sends ready, but keeps the channel open
        let _parked = remote;

        let err = Coordinator::connect(
            Box::new(host_read),
            Box::new(host_write),
            None,
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CompressorError::Initialization(_)));
    }

    #[tokio::test]
    async fn worker_crash_rejects_in_flight_requests() {
        let (host, remote) = duplex(1 << 16);
        let (host_read, host_write) = split(host);
        let (remote_read, remote_write) = split(remote);
        tokio::spawn(async move {
            let mut tx = FrameSender::new(remote_write);
            let mut rx = FrameReceiver::new(remote_read);
            tx.send(&Envelope::Ready).await.unwrap();
            // accept one request, then die with it outstanding
            let _ = rx.recv().await;
        });

        let coordinator = Coordinator::connect(
            Box::new(host_read),
            Box::new(host_write),
            None,
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let err = coordinator
            .submit(job(vec![5; 8], "doomed.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompressorError::WorkerCrash(_)));
        assert_eq!(coordinator.pending_count().await, 0);
        assert_eq!(coordinator.state().await, WorkerState::Failed);

        // a dead worker accepts nothing further
        let err = coordinator
            .submit(job(vec![5; 8], "after.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompressorError::State(_)));
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_and_refuses_new_submissions() {
        let (host, remote) = duplex(1 << 16);
        let (host_read, host_write) = split(host);
        let (remote_read, remote_write) = split(remote);
        tokio::spawn(async move {
            let mut tx = FrameSender::new(remote_write);
            let mut rx = FrameReceiver::new(remote_read);
            tx.send(&Envelope::Ready).await.unwrap();
            while let Ok(Some(_)) = rx.recv().await {}
        });

        let coordinator = Arc::new(
            Coordinator::connect(
                Box::new(host_read),
                Box::new(host_write),
                None,
                Duration::from_secs(5),
                Duration::from_secs(60),
            )
            .await
            .unwrap(),
        );

        let in_flight = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.submit(job(vec![0; 8], "pending.png")).await }
        });
        while coordinator.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }

        coordinator.shutdown().await;

        assert!(matches!(
            in_flight.await.unwrap(),
            Err(CompressorError::Shutdown)
        ));
        assert_eq!(coordinator.state().await, WorkerState::Terminated);
        assert_eq!(coordinator.pending_count().await, 0);
        assert!(matches!(
            coordinator.submit(job(vec![0; 8], "late.png")).await,
            Err(CompressorError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn best_tool_selection_survives_the_wire() {
        let mut engine = Engine::new(vec![FixedTool::new("tiny", vec![0; 4])]);
        engine.register(FixedTool::new("tinier", vec![0; 2]));
        let coordinator = coordinator_with_engine(engine, Duration::from_secs(5)).await;

        let outcome = coordinator.submit(job(vec![1; 32], "ok.png")).await.unwrap();
        assert_eq!(outcome.best_tool, "tinier");
        assert_eq!(outcome.all_results.len(), 2);
    }

    #[tokio::test]
    async fn worker_error_envelope_fails_only_that_request() {
        let coordinator =
            coordinator_with_engine(Engine::new(Vec::new()), Duration::from_secs(5)).await;

        let err = coordinator
            .submit(job(vec![1; 32], "bad.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompressorError::Compression(_)));
        // an error envelope settles its own request and nothing else
        assert_eq!(coordinator.pending_count().await, 0);
        assert_eq!(coordinator.state().await, WorkerState::Ready);
    }
}
