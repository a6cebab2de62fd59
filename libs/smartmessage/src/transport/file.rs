//! File, FIFO, and stdout sinks
//!
//! Line-oriented publish sinks with three write modes (direct, buffered,
//! async worker), optional path partitioning, and tail-based subscription.
//! FIFOs are read with a choice of acquisition strategies on unix and
//! degrade to regular-file tailing elsewhere. Stdout is publish-only.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use smartmessage_errors::{Result, SmartMessageError};

use crate::dispatcher::Dispatcher;
use crate::dlq::DeadLetterQueue;
use crate::header::MessageHeader;
use crate::message::Message;
use crate::serializer::{from_wire_value, Envelope, JsonSerializer, Serializer};
use crate::subscription::{MessageHandler, Subscription, SubscriptionFilter};
use crate::transport::{StatsCounters, Transport, TransportStats};

/// Line format written by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    /// One full wire object per line (default)
    #[default]
    Jsonl,
    /// One line per record with null header fields elided
    Compact,
    /// Indented multi-line records, meant for stdout
    Pretty,
}

/// Where published lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    Path(PathBuf),
    Stdout,
}

/// Behavior of the async write queue at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Publisher waits for space (default)
    #[default]
    Block,
    /// The incoming record is discarded
    DropNewest,
    /// The oldest queued record is discarded
    DropOldest,
}

/// How published lines reach the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileWriteMode {
    /// Write and flush synchronously (default)
    #[default]
    Direct,
    /// Accumulate and flush on size or age
    Buffered {
        max_bytes: usize,
        max_age: Duration,
    },
    /// Bounded queue drained by a worker task
    Async {
        capacity: usize,
        overflow: OverflowPolicy,
    },
}

/// FIFO read acquisition strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoMode {
    /// Open blocks until a writer appears; reads block for data
    Blocking,
    /// Non-blocking reads with a poll interval
    NonBlocking { poll_interval: Duration },
    /// Readiness-driven reads via poll(2)
    Select,
}

/// Tail subscription options.
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Start at the beginning instead of the current end
    pub from_beginning: bool,

    /// Sleep between reads at end-of-file
    pub poll_interval: Duration,

    /// FIFO strategy when the target is a named pipe
    pub fifo: FifoMode,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            from_beginning: false,
            poll_interval: Duration::from_millis(200),
            fifo: FifoMode::Blocking,
        }
    }
}

/// Maps an envelope to the file it lands in.
pub type FilePartitioner =
    Arc<dyn Fn(&MessageHeader, &Map<String, Value>) -> PathBuf + Send + Sync>;

/// File transport options.
#[derive(Clone)]
pub struct FileTransportConfig {
    pub target: SinkTarget,
    pub format: FileFormat,
    pub write_mode: FileWriteMode,
    pub partitioner: Option<FilePartitioner>,
    pub tail: TailConfig,
}

impl FileTransportConfig {
    pub fn to_path(path: impl Into<PathBuf>) -> Self {
        Self {
            target: SinkTarget::Path(path.into()),
            format: FileFormat::default(),
            write_mode: FileWriteMode::default(),
            partitioner: None,
            tail: TailConfig::default(),
        }
    }

    pub fn to_stdout() -> Self {
        Self {
            target: SinkTarget::Stdout,
            format: FileFormat::Pretty,
            write_mode: FileWriteMode::default(),
            partitioner: None,
            tail: TailConfig::default(),
        }
    }
}

struct WriterState {
    file: std::fs::File,
    buffer: Vec<u8>,
    last_flush: Instant,
}

struct WriteJob {
    path: PathBuf,
    bytes: Vec<u8>,
    envelope: Envelope,
}

struct AsyncQueue {
    jobs: std::sync::Mutex<VecDeque<WriteJob>>,
    capacity: usize,
    overflow: OverflowPolicy,
    jobs_available: Notify,
    space_available: Notify,
}

/// Line-oriented file/FIFO/stdout transport.
pub struct FileTransport {
    self_ref: Weak<Self>,
    config: FileTransportConfig,
    dispatcher: Arc<Dispatcher>,
    serializer: Arc<dyn Serializer>,
    dlq: Option<Arc<DeadLetterQueue>>,
    writers: Mutex<HashMap<PathBuf, WriterState>>,
    async_queue: Option<Arc<AsyncQueue>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    tail_task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    stats: StatsCounters,
}

impl FileTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, config: FileTransportConfig) -> Arc<Self> {
        Self::with_dlq(dispatcher, config, None)
    }

    pub fn with_dlq(
        dispatcher: Arc<Dispatcher>,
        config: FileTransportConfig,
        dlq: Option<Arc<DeadLetterQueue>>,
    ) -> Arc<Self> {
        let async_queue = match config.write_mode {
            FileWriteMode::Async { capacity, overflow } => Some(Arc::new(AsyncQueue {
                jobs: std::sync::Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                overflow,
                jobs_available: Notify::new(),
                space_available: Notify::new(),
            })),
            _ => None,
        };

        let transport = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            dispatcher,
            serializer: Arc::new(JsonSerializer),
            dlq,
            writers: Mutex::new(HashMap::new()),
            async_queue,
            worker: Mutex::new(None),
            flusher: Mutex::new(None),
            tail_task: Mutex::new(None),
            connected: AtomicBool::new(true),
            stats: StatsCounters::default(),
        });

        Self::spawn_background_tasks(&transport);
        transport
    }

    fn spawn_background_tasks(transport: &Arc<Self>) {
        if transport.async_queue.is_some() {
            let worker = {
                let transport = transport.clone();
                tokio::spawn(async move { transport.drain_write_queue().await })
            };
            *transport.worker.try_lock().expect("fresh transport") = Some(worker);
        }

        if let FileWriteMode::Buffered { max_age, .. } = transport.config.write_mode {
            let flusher = {
                let transport = transport.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(max_age.max(Duration::from_millis(10)));
                    loop {
                        ticker.tick().await;
                        if !transport.connected.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Err(e) = transport.flush_all().await {
                            warn!(error = %e, "periodic flush failed");
                        }
                    }
                })
            };
            *transport.flusher.try_lock().expect("fresh transport") = Some(flusher);
        }
    }

    /// Render one record in the configured line format.
    fn render_line(&self, message: &Message) -> Result<Vec<u8>> {
        let wire = message.to_wire()?;

        let encoded = match self.config.format {
            FileFormat::Jsonl => serde_json::to_vec(&wire),
            FileFormat::Compact => serde_json::to_vec(&compact_wire(wire)),
            FileFormat::Pretty => serde_json::to_vec_pretty(&wire),
        };

        let mut bytes = encoded.map_err(|e| SmartMessageError::Serialization {
            message: e.to_string(),
            format: self.format_tag().to_string(),
            code: "SERIALIZATION_ERROR".to_string(),
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn format_tag(&self) -> &'static str {
        match self.config.format {
            FileFormat::Jsonl => "jsonl",
            FileFormat::Compact => "compact",
            FileFormat::Pretty => "pretty",
        }
    }

    fn target_path(&self, message: &Message) -> Option<PathBuf> {
        match (&self.config.target, &self.config.partitioner) {
            (SinkTarget::Stdout, _) => None,
            (SinkTarget::Path(_), Some(partitioner)) => {
                Some(partitioner(message.header(), message.properties()))
            }
            (SinkTarget::Path(path), None) => Some(path.clone()),
        }
    }

    async fn write_direct(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut writers = self.writers.lock().await;
        let state = self.writer_state(&mut writers, path)?;
        state
            .file
            .write_all(bytes)
            .and_then(|_| state.file.flush())
            .map_err(|e| file_error(path, "write", e))
    }

    async fn write_buffered(
        &self,
        path: &Path,
        bytes: &[u8],
        max_bytes: usize,
        max_age: Duration,
    ) -> Result<()> {
        let mut writers = self.writers.lock().await;
        let state = self.writer_state(&mut writers, path)?;
        state.buffer.extend_from_slice(bytes);

        if state.buffer.len() >= max_bytes || state.last_flush.elapsed() >= max_age {
            flush_state(path, state)?;
        }
        Ok(())
    }

    fn writer_state<'a>(
        &self,
        writers: &'a mut HashMap<PathBuf, WriterState>,
        path: &Path,
    ) -> Result<&'a mut WriterState> {
        if !writers.contains_key(path) {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|e| file_error(path, "create_dir", e))?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| file_error(path, "open", e))?;
            writers.insert(
                path.to_path_buf(),
                WriterState {
                    file,
                    buffer: Vec::new(),
                    last_flush: Instant::now(),
                },
            );
        }
        Ok(writers.get_mut(path).expect("writer just inserted"))
    }

    /// Flush every buffered writer.
    pub async fn flush_all(&self) -> Result<()> {
        let mut writers = self.writers.lock().await;
        for (path, state) in writers.iter_mut() {
            flush_state(path, state)?;
        }
        Ok(())
    }

    async fn enqueue_async(&self, job: WriteJob) -> Result<()> {
        let queue = self.async_queue.as_ref().expect("async mode configured");

        loop {
            {
                let mut jobs = queue.jobs.lock().expect("write queue poisoned");
                if jobs.len() < queue.capacity {
                    jobs.push_back(job);
                    queue.jobs_available.notify_one();
                    return Ok(());
                }

                match queue.overflow {
                    OverflowPolicy::DropNewest => {
                        warn!("write queue full, dropping newest record");
                        self.stats.record_failed();
                        return Ok(());
                    }
                    OverflowPolicy::DropOldest => {
                        warn!("write queue full, dropping oldest record");
                        jobs.pop_front();
                        jobs.push_back(job);
                        self.stats.record_failed();
                        queue.jobs_available.notify_one();
                        return Ok(());
                    }
                    OverflowPolicy::Block => {}
                }
            }
            queue.space_available.notified().await;
            if !self.connected.load(Ordering::SeqCst) {
                return Err(SmartMessageError::Connection {
                    message: "file transport disconnected while blocked".to_string(),
                    endpoint: None,
                    code: "CONNECTION_ERROR".to_string(),
                });
            }
        }
    }

    async fn drain_write_queue(self: Arc<Self>) {
        let queue = self.async_queue.as_ref().expect("async mode configured").clone();

        loop {
            let job = {
                let mut jobs = queue.jobs.lock().expect("write queue poisoned");
                jobs.pop_front()
            };

            match job {
                Some(job) => {
                    queue.space_available.notify_one();
                    if let Err(e) = self.write_direct(&job.path, &job.bytes).await {
                        warn!(error = %e, "async write failed");
                        self.stats.record_failed();
                        if let Some(dlq) = &self.dlq {
                            let _ = dlq.enqueue_envelope(
                                &job.envelope,
                                self.format_tag(),
                                &e.to_string(),
                                "file",
                                0,
                            );
                        }
                    }
                }
                None => {
                    if !self.connected.load(Ordering::SeqCst) {
                        break;
                    }
                    let _ = tokio::time::timeout(
                        Duration::from_millis(200),
                        queue.jobs_available.notified(),
                    )
                    .await;
                }
            }
        }
    }

    fn write_stdout(&self, bytes: &[u8]) -> Result<()> {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        lock.write_all(bytes)
            .and_then(|_| lock.flush())
            .map_err(|e| SmartMessageError::FileSystem {
                message: e.to_string(),
                path: Some("stdout".to_string()),
                operation: "write".to_string(),
                code: "FILESYSTEM_ERROR".to_string(),
            })
    }

    async fn deliver_line(&self, line: &str) {
        let parsed: std::result::Result<Value, _> = serde_json::from_str(line);
        let envelope = parsed
            .map_err(|e| SmartMessageError::Serialization {
                message: e.to_string(),
                format: "json".to_string(),
                code: "SERIALIZATION_ERROR".to_string(),
            })
            .and_then(from_wire_value);

        match envelope {
            Ok(envelope) => {
                self.stats.record_received();
                if let Err(e) = self.receive(envelope).await {
                    warn!(error = %e, "dispatch of tailed line failed");
                }
            }
            Err(e) => {
                self.stats.record_failed();
                warn!(error = %e, "skipping unparseable tailed line");
            }
        }
    }

    /// Tail a regular file from the configured position.
    async fn tail_file(self: Arc<Self>, path: PathBuf) {
        let cfg = self.config.tail.clone();

        let file = loop {
            if !self.connected.load(Ordering::SeqCst) {
                return;
            }
            match tokio::fs::File::open(&path).await {
                Ok(file) => break file,
                Err(_) => tokio::time::sleep(cfg.poll_interval).await,
            }
        };

        let mut reader = BufReader::new(file);
        if !cfg.from_beginning {
            if let Err(e) = reader.seek(std::io::SeekFrom::End(0)).await {
                warn!(error = %e, "failed to seek to end, reading from start");
            }
        }

        let mut line = String::new();
        while self.connected.load(Ordering::SeqCst) {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => tokio::time::sleep(cfg.poll_interval).await,
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        self.deliver_line(trimmed).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "tail read failed");
                    tokio::time::sleep(cfg.poll_interval).await;
                }
            }
        }
    }

    /// Tail a unix FIFO with the configured acquisition strategy; lines
    /// are read on a blocking thread and forwarded for dispatch.
    #[cfg(unix)]
    async fn tail_fifo(self: Arc<Self>, path: PathBuf) {
        let cfg = self.config.tail.clone();
        let (tx, mut rx) = mpsc::channel::<String>(256);

        let reader_flag = self.clone();
        tokio::task::spawn_blocking(move || {
            read_fifo_lines(&path, cfg.fifo, tx, || {
                reader_flag.connected.load(Ordering::SeqCst)
            })
        });

        while let Some(line) = rx.recv().await {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                self.deliver_line(trimmed).await;
            }
        }
    }

    async fn start_tail(self: Arc<Self>, path: PathBuf) {
        let mut tail = self.tail_task.lock().await;
        if tail.is_some() {
            return;
        }

        let transport = self.clone();
        let handle = if is_fifo(&path) {
            #[cfg(unix)]
            {
                tokio::spawn(async move { transport.tail_fifo(path).await })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async move { transport.tail_file(path).await })
            }
        } else {
            tokio::spawn(async move { transport.tail_file(path).await })
        };
        *tail = Some(handle);
    }
}

#[async_trait]
impl Transport for FileTransport {
    fn name(&self) -> &str {
        match self.config.target {
            SinkTarget::Stdout => "stdout",
            SinkTarget::Path(_) => "file",
        }
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        self.serializer.clone()
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SmartMessageError::Connection {
                message: "file transport is disconnected".to_string(),
                endpoint: None,
                code: "CONNECTION_ERROR".to_string(),
            });
        }

        let bytes = self.render_line(message)?;

        let result = match self.target_path(message) {
            None => self.write_stdout(&bytes),
            Some(path) => match self.config.write_mode {
                FileWriteMode::Direct => self.write_direct(&path, &bytes).await,
                FileWriteMode::Buffered { max_bytes, max_age } => {
                    self.write_buffered(&path, &bytes, max_bytes, max_age).await
                }
                FileWriteMode::Async { .. } => {
                    self.enqueue_async(WriteJob {
                        path,
                        bytes,
                        envelope: message.to_envelope(),
                    })
                    .await
                }
            },
        };

        match result {
            Ok(()) => {
                self.stats.record_published();
                Ok(())
            }
            Err(e) => {
                self.stats.record_failed();
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        message_class: &str,
        handler: Arc<dyn MessageHandler>,
        filter: SubscriptionFilter,
    ) -> Result<()> {
        let path = match &self.config.target {
            SinkTarget::Stdout => {
                warn!("stdout transport is publish-only, ignoring subscription");
                return Ok(());
            }
            SinkTarget::Path(path) => path.clone(),
        };

        self.dispatcher
            .subscribe(Subscription::new(message_class, handler, filter))
            .await?;

        let transport = self.self_ref.upgrade().expect("transport dropped");
        transport.start_tail(path).await;
        Ok(())
    }

    async fn unsubscribe(&self, message_class: &str, handler_id: Option<&str>) -> Result<()> {
        self.dispatcher.unsubscribe(message_class, handler_id).await?;
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Idempotent; flushes buffers, stops the tail and worker, and
        // closes every partition handle.
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(queue) = &self.async_queue {
            queue.jobs_available.notify_waiters();
            queue.space_available.notify_waiters();
        }
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), worker).await;
        }
        if let Some(flusher) = self.flusher.lock().await.take() {
            flusher.abort();
        }
        if let Some(tail) = self.tail_task.lock().await.take() {
            tail.abort();
        }

        self.flush_all().await?;
        self.writers.lock().await.clear();
        Ok(())
    }

    async fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

fn flush_state(path: &Path, state: &mut WriterState) -> Result<()> {
    if !state.buffer.is_empty() {
        let buffer = std::mem::take(&mut state.buffer);
        state
            .file
            .write_all(&buffer)
            .map_err(|e| file_error(path, "write", e))?;
    }
    state.file.flush().map_err(|e| file_error(path, "flush", e))?;
    state.last_flush = Instant::now();
    Ok(())
}

/// Strip null values from the wire object and its header map.
fn compact_wire(wire: Value) -> Value {
    match wire {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| match v {
                    Value::Object(inner) => (
                        k,
                        Value::Object(inner.into_iter().filter(|(_, v)| !v.is_null()).collect()),
                    ),
                    other => (k, other),
                })
                .collect(),
        ),
        other => other,
    }
}

fn file_error(path: &Path, operation: &str, e: std::io::Error) -> SmartMessageError {
    SmartMessageError::FileSystem {
        message: e.to_string(),
        path: Some(path.display().to_string()),
        operation: operation.to_string(),
        code: "FILESYSTEM_ERROR".to_string(),
    }
}

#[cfg(unix)]
fn is_fifo(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_fifo(_path: &Path) -> bool {
    false
}

/// Blocking FIFO reader: accumulates bytes into lines and forwards them
/// until the transport disconnects.
#[cfg(unix)]
fn read_fifo_lines(
    path: &Path,
    mode: FifoMode,
    tx: mpsc::Sender<String>,
    still_connected: impl Fn() -> bool,
) {
    use std::io::Read;
    use std::os::unix::fs::OpenOptionsExt;

    let open = |non_blocking: bool| -> std::io::Result<std::fs::File> {
        let mut options = OpenOptions::new();
        options.read(true);
        if non_blocking {
            options.custom_flags(nix::libc::O_NONBLOCK);
        }
        options.open(path)
    };

    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];

    'acquire: while still_connected() {
        let non_blocking = !matches!(mode, FifoMode::Blocking);
        let mut file = match open(non_blocking) {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "failed to open fifo");
                std::thread::sleep(Duration::from_millis(200));
                continue;
            }
        };

        loop {
            if !still_connected() {
                break 'acquire;
            }

            if let FifoMode::Select = mode {
                use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
                use std::os::fd::AsFd;
                let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(500u16)) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "fifo poll failed");
                        continue 'acquire;
                    }
                }
            }

            match file.read(&mut chunk) {
                // Writer side closed; reacquire.
                Ok(0) => match mode {
                    FifoMode::Blocking => continue 'acquire,
                    FifoMode::NonBlocking { poll_interval } => {
                        std::thread::sleep(poll_interval)
                    }
                    FifoMode::Select => continue 'acquire,
                },
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=newline).collect();
                        if let Ok(text) = String::from_utf8(line) {
                            if tx.blocking_send(text).is_err() {
                                break 'acquire;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let interval = match mode {
                        FifoMode::NonBlocking { poll_interval } => poll_interval,
                        _ => Duration::from_millis(50),
                    };
                    std::thread::sleep(interval);
                }
                Err(e) => {
                    warn!(error = %e, "fifo read failed");
                    continue 'acquire;
                }
            }
        }
    }
}
