//! Connection management
//!
//! A [`Connection`] owns one [`Transport`] and serializes every exchange on
//! it. Two threads run per connection:
//!
//! - the worker takes queued batches (and raw exchanges) one at a time,
//!   writes each command and waits for its reply;
//! - the reader drains the transport line by line, handing each line to the
//!   request currently waiting or, when none is, to the out-of-band
//!   [`EventRegistry`].
//!
//! Callers submit work through async methods and await a oneshot reply, so
//! any number of tasks can share one connection.

use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::EventRegistry;
use super::raw::{ByteAccumulator, RawPort};
use super::request::PendingReply;
use super::transport::StreamTransport;
use super::{ConnectionOptions, MatchGroups, ProtocolError, Request, Response, Transport};

/// How often a waiting request checks for cancellation and shutdown
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of every request in a batch, in submission order
pub type BatchResult = Vec<Result<Response, ProtocolError>>;

type RawJob = Box<dyn FnOnce(Result<&mut RawPort<'_>, ProtocolError>) + Send>;

enum Job {
    Batch {
        requests: Vec<Request>,
        cancel: CancellationToken,
        reply: oneshot::Sender<BatchResult>,
    },
    Raw(RawJob),
}

impl Job {
    fn refuse(self, err: ProtocolError) {
        match self {
            Job::Batch {
                requests, reply, ..
            } => {
                let _ = reply.send(vec![Err(err); requests.len()]);
            }
            Job::Raw(exchange) => exchange(Err(err)),
        }
    }
}

/// What the reader hands to the waiting request
enum LineEvent {
    Line(String),
    Failed(ProtocolError),
}

/// Handshake between the worker and the reader around raw exchanges
#[derive(Debug)]
struct ReaderGate {
    raw_requested: bool,
    reader_parked: bool,
    reader_running: bool,
}

/// State shared by the connection handle, the worker and the reader
struct Engine {
    id: Uuid,
    options: ConnectionOptions,
    transport: Box<dyn Transport>,
    events: EventRegistry,
    active: Mutex<Option<std_mpsc::Sender<LineEvent>>>,
    gate: Mutex<ReaderGate>,
    gate_changed: Condvar,
    failure: Mutex<Option<ProtocolError>>,
    shutdown: CancellationToken,
}

/// Clears the active slot when the request stops waiting, however it ends
struct ActiveRequest<'a> {
    slot: &'a Mutex<Option<std_mpsc::Sender<LineEvent>>>,
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Engine {
    fn failure(&self) -> Option<ProtocolError> {
        lock(&self.failure).clone()
    }

    /// Record a fatal transport error; the first one wins
    fn fail(&self, err: ProtocolError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            warn!(connection = %self.id, error = %err, "transport failed");
            *failure = Some(err);
        }
    }

    /// Why a job must not run, if it must not
    fn refusal(&self) -> Option<ProtocolError> {
        if self.shutdown.is_cancelled() {
            return Some(ProtocolError::ConnectionClosed);
        }
        self.failure()
    }

    // ---- worker ----

    fn run_worker(&self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        debug!(connection = %self.id, "worker started");
        while let Some(job) = jobs.blocking_recv() {
            if let Some(err) = self.refusal() {
                job.refuse(err);
                continue;
            }
            match job {
                Job::Batch {
                    requests,
                    cancel,
                    reply,
                } => {
                    let results = self.run_batch(requests, &cancel);
                    let _ = reply.send(results);
                }
                Job::Raw(exchange) => self.run_raw(exchange),
            }
        }
        debug!(connection = %self.id, "worker stopped");
    }

    fn run_batch(&self, requests: Vec<Request>, cancel: &CancellationToken) -> BatchResult {
        let mut results = Vec::with_capacity(requests.len());
        let mut abandoned: Option<ProtocolError> = None;
        for request in requests {
            if let Some(err) = &abandoned {
                results.push(Err(err.clone()));
                continue;
            }
            let result = self.run_request(&request, cancel);
            if let Err(err) = &result {
                debug!(
                    connection = %self.id,
                    command = %request.command,
                    error = %err,
                    "request failed, abandoning rest of batch"
                );
                abandoned = Some(err.clone());
            }
            results.push(result);
        }
        results
    }

    fn run_request(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Response, ProtocolError> {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }

        let (sink, lines) = std_mpsc::channel();
        *lock(&self.active) = Some(sink);
        let _active = ActiveRequest { slot: &self.active };

        debug!(connection = %self.id, command = %request.command, "sending");
        if let Err(err) = self.transport.write_line(&request.command) {
            if matches!(err, ProtocolError::TransportFailure(_)) {
                self.fail(err.clone());
            }
            return Err(err);
        }

        let timeout = request.timeout.unwrap_or_else(|| self.options.read_timeout());
        let deadline = Instant::now() + timeout;
        let mut pending = PendingReply::new(request.terminator.clone());

        loop {
            if cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            if self.shutdown.is_cancelled() {
                return Err(ProtocolError::ConnectionClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    connection = %self.id,
                    command = %request.command,
                    unmatched = pending.received(),
                    "reply timed out"
                );
                return Err(ProtocolError::Timeout {
                    command: request.command.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            match lines.recv_timeout((deadline - now).min(CANCEL_POLL_INTERVAL)) {
                Ok(LineEvent::Line(line)) => {
                    if let Some(response) = pending.push(line) {
                        debug!(
                            connection = %self.id,
                            command = %request.command,
                            lines = response.lines.len(),
                            "reply complete"
                        );
                        return Ok(response);
                    }
                }
                Ok(LineEvent::Failed(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(ProtocolError::ConnectionClosed),
            }
        }
    }

    fn run_raw(&self, exchange: RawJob) {
        if !self.park_reader() {
            let err = self
                .refusal()
                .unwrap_or(ProtocolError::ConnectionClosed);
            exchange(Err(err));
            return;
        }

        debug!(connection = %self.id, "raw exchange started");
        let mut port = RawPort::new(self.transport.as_ref(), self.options.read_timeout());
        exchange(Ok(&mut port));
        if let Some(err) = port.take_failure() {
            self.fail(err);
        }
        debug!(connection = %self.id, "raw exchange finished");

        self.release_reader();
    }

    /// Ask the reader to stop taking lines; true once it has
    fn park_reader(&self) -> bool {
        let mut gate = lock(&self.gate);
        gate.raw_requested = true;
        self.gate_changed.notify_all();
        while !gate.reader_parked && gate.reader_running && !self.shutdown.is_cancelled() {
            gate = self
                .gate_changed
                .wait_timeout(gate, self.options.poll_interval())
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        // A stopped reader cannot interfere, but only a healthy line is usable
        let usable = gate.reader_parked || (!gate.reader_running && self.refusal().is_none());
        if !usable {
            gate.raw_requested = false;
        }
        usable
    }

    fn release_reader(&self) {
        lock(&self.gate).raw_requested = false;
        self.gate_changed.notify_all();
    }

    // ---- reader ----

    fn run_reader(&self) {
        debug!(connection = %self.id, "reader started");
        let poll = self.options.poll_interval();
        while !self.shutdown.is_cancelled() {
            if self.wait_while_raw() {
                continue;
            }
            match self.transport.read_line(poll) {
                Ok(Some(line)) => self.route(line),
                Ok(None) => {}
                Err(err) => {
                    if !self.shutdown.is_cancelled() {
                        self.fail(err.clone());
                        if let Some(sink) = lock(&self.active).as_ref() {
                            let _ = sink.send(LineEvent::Failed(err));
                        }
                    }
                    break;
                }
            }
        }

        let mut gate = lock(&self.gate);
        gate.reader_running = false;
        gate.reader_parked = false;
        self.gate_changed.notify_all();
        debug!(connection = %self.id, "reader stopped");
    }

    /// Stay off the transport while a raw exchange owns it; true if we waited
    fn wait_while_raw(&self) -> bool {
        let mut gate = lock(&self.gate);
        if !gate.raw_requested {
            return false;
        }
        gate.reader_parked = true;
        self.gate_changed.notify_all();
        while gate.raw_requested && !self.shutdown.is_cancelled() {
            gate = self
                .gate_changed
                .wait_timeout(gate, self.options.poll_interval())
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        gate.reader_parked = false;
        true
    }

    /// Give a line to the waiting request, or to the out-of-band handlers
    fn route(&self, line: String) {
        let line = {
            let active = lock(&self.active);
            match active.as_ref() {
                Some(sink) => match sink.send(LineEvent::Line(line)) {
                    Ok(()) => return,
                    Err(std_mpsc::SendError(LineEvent::Line(line))) => line,
                    Err(_) => return,
                },
                None => line,
            }
        };
        self.events.dispatch(&line);
    }
}

/// An instrument line shared by any number of callers
pub struct Connection {
    engine: Arc<Engine>,
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Start the engine on `transport`
    pub fn new<T>(transport: T, options: ConnectionOptions) -> Result<Self, ProtocolError>
    where
        T: Transport + 'static,
    {
        options.validate()?;
        let engine = Arc::new(Engine {
            id: Uuid::new_v4(),
            options,
            transport: Box::new(transport),
            events: EventRegistry::new(),
            active: Mutex::new(None),
            gate: Mutex::new(ReaderGate {
                raw_requested: false,
                reader_parked: false,
                reader_running: true,
            }),
            gate_changed: Condvar::new(),
            failure: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel();

        let reader_engine = Arc::clone(&engine);
        let reader = thread::Builder::new()
            .name(format!("serialproxy-reader-{}", engine.id.simple()))
            .spawn(move || reader_engine.run_reader())?;

        let worker_engine = Arc::clone(&engine);
        let worker = match thread::Builder::new()
            .name(format!("serialproxy-worker-{}", engine.id.simple()))
            .spawn(move || worker_engine.run_worker(rx))
        {
            Ok(worker) => worker,
            Err(e) => {
                engine.shutdown.cancel();
                let _ = reader.join();
                return Err(e.into());
            }
        };

        info!(connection = %engine.id, "connection opened");
        Ok(Self {
            engine,
            jobs: Mutex::new(Some(tx)),
            threads: Mutex::new(vec![worker, reader]),
        })
    }

    /// Open a physical serial port
    pub fn open_serial(path: &str, options: ConnectionOptions) -> Result<Self, ProtocolError> {
        let transport = StreamTransport::open_serial(path, &options)?;
        Self::new(transport, options)
    }

    /// Connect through a serial-over-TCP bridge ("host:port")
    pub fn open_tcp(addr: &str, options: ConnectionOptions) -> Result<Self, ProtocolError> {
        let transport = StreamTransport::open_tcp(addr, &options)?;
        Self::new(transport, options)
    }

    /// Identifier used in log output
    pub fn id(&self) -> Uuid {
        self.engine.id
    }

    /// Options the connection was opened with
    pub fn options(&self) -> &ConnectionOptions {
        &self.engine.options
    }

    /// Whether the connection was closed or its transport failed
    pub fn is_closed(&self) -> bool {
        self.engine.refusal().is_some()
    }

    fn submit(&self, job: Job) -> Result<(), ProtocolError> {
        if self.engine.failure().is_some() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let jobs = lock(&self.jobs);
        let sender = jobs.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        sender
            .send(job)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Run a batch; results come back per request, in order.
    ///
    /// The batch runs without interleaving with any other batch. When a
    /// request fails, the rest of the batch is not sent and reports the
    /// same error.
    pub async fn execute(&self, requests: Vec<Request>) -> BatchResult {
        self.execute_with(requests, CancellationToken::new()).await
    }

    /// [`execute`](Self::execute) with a caller-controlled cancellation token
    pub async fn execute_with(
        &self,
        requests: Vec<Request>,
        cancel: CancellationToken,
    ) -> BatchResult {
        let count = requests.len();
        if count == 0 {
            return Vec::new();
        }
        let (reply, results) = oneshot::channel();
        if let Err(err) = self.submit(Job::Batch {
            requests,
            cancel,
            reply,
        }) {
            return vec![Err(err); count];
        }
        results
            .await
            .unwrap_or_else(|_| vec![Err(ProtocolError::ConnectionClosed); count])
    }

    /// Run a single request
    pub async fn execute_one(&self, request: Request) -> Result<Response, ProtocolError> {
        self.execute(vec![request])
            .await
            .pop()
            .unwrap_or(Err(ProtocolError::ConnectionClosed))
    }

    /// Run a batch and stop at the first error
    pub async fn execute_all(&self, requests: Vec<Request>) -> Result<Vec<Response>, ProtocolError> {
        self.execute(requests).await.into_iter().collect()
    }

    /// Take the line for one binary exchange.
    ///
    /// `exchange` runs on the worker, between batches, with the reader
    /// paused; nothing it reads is seen by out-of-band handlers.
    pub async fn execute_raw_with<F, T>(&self, exchange: F) -> Result<T, ProtocolError>
    where
        F: FnOnce(&mut RawPort<'_>) -> Result<T, ProtocolError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job: RawJob = Box::new(move |port: Result<&mut RawPort<'_>, ProtocolError>| {
            let _ = reply.send(port.and_then(exchange));
        });
        self.submit(Job::Raw(job))?;
        result.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Write `request` and read the reply through `accumulator`
    pub async fn execute_raw<A>(
        &self,
        request: Vec<u8>,
        mut accumulator: A,
    ) -> Result<Vec<u8>, ProtocolError>
    where
        A: ByteAccumulator + 'static,
    {
        self.execute_raw_with(move |port| port.exchange(&request, &mut accumulator))
            .await
    }

    /// Call `handler` for every unsolicited line matching `pattern`.
    ///
    /// Handlers run on the reader thread, so they should return quickly.
    pub fn register_event<F>(&self, pattern: &str, handler: F) -> Result<(), ProtocolError>
    where
        F: Fn(&MatchGroups) + Send + Sync + 'static,
    {
        self.engine.events.register(pattern, handler)
    }

    /// Stop the engine and release the transport.
    ///
    /// Queued and active requests fail with `ConnectionClosed`. Closing
    /// twice is a no-op.
    pub fn close(&self) -> Result<(), ProtocolError> {
        let Some(sender) = lock(&self.jobs).take() else {
            return Ok(());
        };
        self.engine.shutdown.cancel();
        self.engine.gate_changed.notify_all();
        drop(sender);

        let current = thread::current().id();
        for handle in lock(&self.threads).drain(..) {
            // A handler closing its own connection cannot wait for itself
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(connection = %self.engine.id, "engine thread panicked");
            }
        }

        info!(connection = %self.engine.id, "connection closed");
        self.engine.transport.close()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
