//! Test doubles for driving the bridge without hardware or a network
//!
//! - [`MockSerialLink`] replays scripted serial traffic, including read
//!   errors and failed connects
//! - [`FlakyDatabase`] wraps any [`RemoteDatabase`] and injects transient,
//!   permanent or slow failures
//!
//! Both are cheap to clone and share their state, so a test can hand one copy
//! to the bridge and keep another to inspect or script it.
//!
//! # Example
//!
//! ```rust,ignore
//! use smartbin_bridge::test_utils::{frame, MockSerialLink};
//!
//! let link = MockSerialLink::new();
//! link.push_bytes(frame(&serde_json::json!({"materialDetected": "None"})));
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::DEFAULT_FRAME_PREFIX;
use crate::database::RemoteDatabase;
use crate::error::{BridgeError, Result};
use crate::interface::SerialLink;
use crate::reading::LogEntry;

/// How long a mock read waits when nothing is scripted
const DEFAULT_IDLE_READ: Duration = Duration::from_millis(50);

/// One scripted result of [`SerialLink::read_chunk`]
#[derive(Debug)]
enum MockRead {
    Chunk(Bytes),
    Quiet,
    Fail(BridgeError),
}

#[derive(Debug, Default)]
struct MockLinkState {
    connected: bool,
    script: VecDeque<MockRead>,
    failing_connects: u32,
    connects: u32,
    disconnects: u32,
    reads: u32,
}

/// Scripted serial link
///
/// Reads pop the script front to back. An empty script behaves like a quiet
/// line: the read waits a short while and returns `None`.
#[derive(Debug, Clone)]
pub struct MockSerialLink {
    state: Arc<Mutex<MockLinkState>>,
    idle_read: Duration,
}

impl MockSerialLink {
    /// Create a link with an empty script
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockLinkState::default())),
            idle_read: DEFAULT_IDLE_READ,
        }
    }

    /// Change how long an unscripted read waits
    pub fn with_idle_read(mut self, idle: Duration) -> Self {
        self.idle_read = idle;
        self
    }

    /// Queue raw bytes as a single chunk
    pub fn push_bytes(&self, bytes: impl Into<Bytes>) {
        self.state
            .lock()
            .script
            .push_back(MockRead::Chunk(bytes.into()));
    }

    /// Queue a full line, terminator added
    pub fn push_line(&self, line: &str) {
        self.push_bytes(format!("{}\n", line));
    }

    /// Queue a read that returns no data
    pub fn push_quiet(&self) {
        self.state.lock().script.push_back(MockRead::Quiet);
    }

    /// Queue a read failure
    pub fn push_error(&self, error: BridgeError) {
        self.state.lock().script.push_back(MockRead::Fail(error));
    }

    /// Queue the device going away
    pub fn push_disconnect(&self) {
        self.push_error(BridgeError::Disconnected);
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().failing_connects = n;
    }

    /// Whether every scripted read has been consumed
    pub fn is_drained(&self) -> bool {
        self.state.lock().script.is_empty()
    }

    /// Connect calls so far, failed ones included
    pub fn connect_calls(&self) -> u32 {
        self.state.lock().connects
    }

    /// Disconnect calls so far
    pub fn disconnect_calls(&self) -> u32 {
        self.state.lock().disconnects
    }

    /// Read calls so far
    pub fn read_calls(&self) -> u32 {
        self.state.lock().reads
    }
}

impl Default for MockSerialLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerialLink for MockSerialLink {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BridgeError::PortNotFound("mock".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let next = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(BridgeError::Disconnected);
            }
            state.reads += 1;
            state.script.pop_front()
        };

        match next {
            Some(MockRead::Chunk(bytes)) => Ok(Some(bytes)),
            Some(MockRead::Quiet) => Ok(None),
            Some(MockRead::Fail(e)) => {
                self.state.lock().connected = false;
                Err(e)
            }
            None => {
                tokio::time::sleep(self.idle_read).await;
                Ok(None)
            }
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Kind of failure [`FlakyDatabase`] injects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retryable, e.g. a dropped connection
    Transient,
    /// Not retryable, e.g. permission denied
    Permanent,
}

impl FailureKind {
    fn to_error(self, op: &str) -> BridgeError {
        match self {
            FailureKind::Transient => BridgeError::TransientRemote(format!("injected {} failure", op)),
            FailureKind::Permanent => BridgeError::PermanentRemote(format!("injected {} failure", op)),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing: u32,
    kind: Option<FailureKind>,
    stalls: u32,
    stall_for: Duration,
}

impl Faults {
    /// Decide what the next call does before reaching the inner database
    fn take(&mut self) -> (Option<FailureKind>, Option<Duration>) {
        let stall = (self.stalls > 0).then(|| {
            self.stalls -= 1;
            self.stall_for
        });
        let fail = match self.kind {
            Some(kind) if self.failing > 0 => {
                self.failing -= 1;
                Some(kind)
            }
            _ => None,
        };
        (fail, stall)
    }
}

/// Database wrapper that fails on request
#[derive(Debug)]
pub struct FlakyDatabase<D> {
    inner: D,
    append_faults: Mutex<Faults>,
    merge_faults: Mutex<Faults>,
    append_calls: AtomicU32,
    merge_calls: AtomicU32,
}

impl<D: RemoteDatabase> FlakyDatabase<D> {
    /// Wrap a database; no faults are armed
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            append_faults: Mutex::new(Faults::default()),
            merge_faults: Mutex::new(Faults::default()),
            append_calls: AtomicU32::new(0),
            merge_calls: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` appends
    pub fn fail_next_appends(&self, n: u32, kind: FailureKind) {
        let mut faults = self.append_faults.lock();
        faults.failing = n;
        faults.kind = Some(kind);
    }

    /// Fail the next `n` merges
    pub fn fail_next_merges(&self, n: u32, kind: FailureKind) {
        let mut faults = self.merge_faults.lock();
        faults.failing = n;
        faults.kind = Some(kind);
    }

    /// Delay the next `n` merges by `delay` before they reach the inner database
    pub fn stall_next_merges(&self, n: u32, delay: Duration) {
        let mut faults = self.merge_faults.lock();
        faults.stalls = n;
        faults.stall_for = delay;
    }

    /// Stop injecting failures
    pub fn heal(&self) {
        *self.append_faults.lock() = Faults::default();
        *self.merge_faults.lock() = Faults::default();
    }

    /// The wrapped database
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Append calls so far, failed ones included
    pub fn append_calls(&self) -> u32 {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Merge calls so far, failed ones included
    pub fn merge_calls(&self) -> u32 {
        self.merge_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<D: RemoteDatabase> RemoteDatabase for FlakyDatabase<D> {
    async fn merge_update(&self, path: &str, partial: &Map<String, Value>) -> Result<()> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        let (fail, stall) = self.merge_faults.lock().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = fail {
            debug!(path, ?kind, "Injecting merge failure");
            return Err(kind.to_error("merge"));
        }
        self.inner.merge_update(path, partial).await
    }

    async fn append_log_entry(&self, path: &str, record: &LogEntry) -> Result<String> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let (fail, stall) = self.append_faults.lock().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = fail {
            debug!(path, ?kind, "Injecting append failure");
            return Err(kind.to_error("append"));
        }
        self.inner.append_log_entry(path, record).await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// Encode a JSON payload as a serial line with the default prefix
pub fn frame(payload: &Value) -> Vec<u8> {
    format!("{}{}\n", DEFAULT_FRAME_PREFIX, payload).into_bytes()
}

/// Payload of a detection with the matching bin status filled in
pub fn detection(material: &str, status: &str) -> Value {
    let mut payload = serde_json::json!({ "materialDetected": material });
    let key = material.to_lowercase();
    if let Value::Object(object) = &mut payload {
        object.insert(key, serde_json::json!({ "status": status }));
    }
    payload
}
