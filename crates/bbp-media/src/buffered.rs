//! Asynchronous single-writer file system.
//!
//! Writers fill pooled fixed-size buffers and hand full ones to one
//! background worker, which performs writes, renames, removals and
//! fsync-on-close strictly in submission order. Reads first drain the queue,
//! so a reader always sees every write issued before it.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, error, trace};

use crate::fsops::FileOps;
use crate::medium::DeltaSink;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Limits of the write-buffer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Size of one buffer in bytes.
    pub buffer_size: usize,
    /// Buffers that may exist at once; producers block beyond this.
    pub max_buffers: usize,
    /// Released buffers kept for reuse; the rest are freed.
    pub kept_buffers: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100_000,
            max_buffers: 100,
            kept_buffers: 20,
        }
    }
}

struct PoolState {
    free: Vec<Vec<u8>>,
    total: usize,
}

struct BufferPool {
    config: BufferPoolConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl BufferPool {
    fn new(config: BufferPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                total: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Take a buffer, blocking while the pool is exhausted.
    fn get(&self) -> Vec<u8> {
        let mut state = lock(&self.state);
        loop {
            if let Some(buf) = state.free.pop() {
                return buf;
            }
            if state.total < self.config.max_buffers {
                state.total += 1;
                return Vec::with_capacity(self.config.buffer_size);
            }
            trace!(total = state.total, "write buffers exhausted, waiting");
            state = wait(&self.released, state);
        }
    }

    fn release(&self, mut buf: Vec<u8>) {
        let mut state = lock(&self.state);
        if state.free.len() < self.config.kept_buffers {
            buf.clear();
            state.free.push(buf);
        } else {
            state.total -= 1;
        }
        self.released.notify_all();
    }

    fn allocated(&self) -> usize {
        lock(&self.state).total
    }
}

type JobFn = Box<dyn FnOnce() -> io::Result<()> + Send>;

struct Job {
    label: String,
    run: JobFn,
}

struct QueueState {
    jobs: VecDeque<Job>,
    executing: bool,
    active: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    changed: Condvar,
    pool: BufferPool,
    failures: AtomicU64,
}

impl Shared {
    fn enqueue(&self, label: String, run: JobFn) {
        let mut queue = lock(&self.queue);
        if !queue.active {
            drop(queue);
            debug!(job = %label, "writer stopped, running job inline");
            self.execute(Job { label, run });
            return;
        }
        queue.jobs.push_back(Job { label, run });
        self.changed.notify_all();
    }

    fn execute(&self, job: Job) {
        trace!(job = %job.label, "buffered job");
        if let Err(e) = (job.run)() {
            self.failures.fetch_add(1, Ordering::SeqCst);
            error!(job = %job.label, error = %e, "buffered job failed");
        }
    }

    fn run(&self) {
        loop {
            let job = {
                let mut queue = lock(&self.queue);
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        queue.executing = true;
                        break job;
                    }
                    if !queue.active {
                        return;
                    }
                    queue = wait(&self.changed, queue);
                }
            };
            self.execute(job);
            lock(&self.queue).executing = false;
            self.changed.notify_all();
        }
    }

    fn wait_for_previous(&self) {
        let mut queue = lock(&self.queue);
        while !queue.jobs.is_empty() || queue.executing {
            queue = wait(&self.changed, queue);
        }
    }
}

/// File operations performed by a background worker thread.
pub struct BufferedFileSystem {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedFileSystem {
    /// Start a writer with the default buffer pool.
    pub fn new() -> io::Result<Self> {
        Self::with_pool(BufferPoolConfig::default())
    }

    pub fn with_pool(config: BufferPoolConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                executing: false,
                active: true,
            }),
            changed: Condvar::new(),
            pool: BufferPool::new(config),
            failures: AtomicU64::new(0),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("bbp-buffered-fs".into())
            .spawn(move || worker_shared.run())?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Block until the queue is empty and no job is running.
    pub fn wait_for_previous(&self) {
        self.shared.wait_for_previous();
    }

    /// Drain the queue, halt the worker and join it. Later jobs run inline.
    pub fn stop(&self) {
        self.wait_for_previous();
        lock(&self.shared.queue).active = false;
        self.shared.changed.notify_all();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                error!("buffered file system worker panicked");
            }
        }
    }

    /// Jobs that failed since start.
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::SeqCst)
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).jobs.len()
    }

    /// Buffers currently allocated by the pool.
    pub fn buffers_allocated(&self) -> usize {
        self.shared.pool.allocated()
    }
}

impl Drop for BufferedFileSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BufferedFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedFileSystem")
            .field("pending", &self.pending())
            .field("failures", &self.failures())
            .finish()
    }
}

struct BufferedSink {
    shared: Arc<Shared>,
    file: Arc<Mutex<File>>,
    path: PathBuf,
    buffer: Option<Vec<u8>>,
}

impl BufferedSink {
    fn switch_buffer(&mut self) {
        let Some(buf) = self.buffer.take() else {
            return;
        };
        if buf.is_empty() {
            self.buffer = Some(buf);
            return;
        }
        let file = Arc::clone(&self.file);
        let shared = Arc::clone(&self.shared);
        let label = format!("write {} bytes to {}", buf.len(), self.path.display());
        self.shared.enqueue(
            label,
            Box::new(move || {
                let result = lock(&file).write_all(&buf);
                shared.pool.release(buf);
                result
            }),
        );
        self.buffer = Some(self.shared.pool.get());
    }
}

impl Write for BufferedSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let capacity = self.shared.pool.config.buffer_size;
        let mut rest = data;
        while !rest.is_empty() {
            let buf = self.buffer.get_or_insert_with(|| self.shared.pool.get());
            let n = rest.len().min(capacity - buf.len());
            buf.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if buf.len() >= capacity {
                self.switch_buffer();
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.switch_buffer();
        Ok(())
    }
}

impl DeltaSink for BufferedSink {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.switch_buffer();
        let file = Arc::clone(&self.file);
        self.shared.enqueue(
            format!("close {}", self.path.display()),
            Box::new(move || {
                let mut file = lock(&file);
                file.flush()?;
                file.sync_all()
            }),
        );
        debug!(path = %self.path.display(), "buffered stream closed");
        Ok(())
    }
}

impl Drop for BufferedSink {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.shared.pool.release(buf);
        }
    }
}

impl FileOps for BufferedFileSystem {
    fn create(&self, path: &Path) -> io::Result<Box<dyn DeltaSink>> {
        let file = File::create(path)?;
        Ok(Box::new(BufferedSink {
            shared: Arc::clone(&self.shared),
            file: Arc::new(Mutex::new(file)),
            path: path.to_path_buf(),
            buffer: None,
        }))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        self.wait_for_previous();
        Ok(Box::new(File::open(path)?))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let (from, to) = (from.to_path_buf(), to.to_path_buf());
        let label = format!("rename {} to {}", from.display(), to.display());
        self.shared.enqueue(label, Box::new(move || std::fs::rename(&from, &to)));
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let path = path.to_path_buf();
        let label = format!("remove {}", path.display());
        self.shared.enqueue(label, Box::new(move || std::fs::remove_file(&path)));
        Ok(())
    }

    fn barrier(&self) {
        self.wait_for_previous();
    }
}
