//! Scripted transport for tests
//!
//! Replays canned replies instead of talking to hardware. Replies are keyed
//! by the exact command (or raw request bytes) written; every write is
//! recorded so tests can assert on what went over the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{ProtocolError, Transport};

/// Something written to the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Written {
    /// A command line, without the newline marker
    Line(String),
    /// Bytes written unchanged
    Raw(Vec<u8>),
}

#[derive(Debug)]
enum Inbound {
    Line(String),
    Byte(u8),
}

#[derive(Default)]
struct ScriptState {
    inbound: VecDeque<(Instant, Inbound)>,
    line_replies: HashMap<String, Vec<String>>,
    raw_replies: HashMap<Vec<u8>, Vec<u8>>,
    written: Vec<Written>,
    reply_delay: Duration,
    read_failure: Option<String>,
    write_failure: Option<String>,
    closed: bool,
}

impl ScriptState {
    fn enqueue(&mut self, at: Instant, item: Inbound) {
        self.inbound.push_back((at, item));
    }

    fn check_open(&self) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<ScriptState>,
    readable: Condvar,
}

/// In-memory [`Transport`] driven by a script
///
/// Cloning yields another handle on the same script, so a test can keep
/// one handle while the connection owns the other.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    /// Transport with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every write of `command` with `lines`
    pub fn reply(&self, command: &str, lines: &[&str]) -> &Self {
        self.state().line_replies.insert(
            command.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    /// Answer every raw write of `request` with `response`
    pub fn reply_raw(&self, request: &[u8], response: &[u8]) -> &Self {
        self.state()
            .raw_replies
            .insert(request.to_vec(), response.to_vec());
        self
    }

    /// Delay scripted replies by `delay` after the triggering write
    pub fn set_reply_delay(&self, delay: Duration) {
        self.state().reply_delay = delay;
    }

    /// Inject an unsolicited line
    pub fn push_line(&self, line: &str) {
        self.state()
            .enqueue(Instant::now(), Inbound::Line(line.to_string()));
        self.shared.readable.notify_all();
    }

    /// Inject unsolicited bytes
    pub fn push_bytes(&self, bytes: &[u8]) {
        let mut state = self.state();
        let now = Instant::now();
        for b in bytes {
            state.enqueue(now, Inbound::Byte(*b));
        }
        drop(state);
        self.shared.readable.notify_all();
    }

    /// Make every following read fail
    pub fn fail_reads(&self, message: &str) {
        self.state().read_failure = Some(message.to_string());
        self.shared.readable.notify_all();
    }

    /// Make every following write fail
    pub fn fail_writes(&self, message: &str) {
        self.state().write_failure = Some(message.to_string());
    }

    /// Everything written so far, in order
    pub fn written(&self) -> Vec<Written> {
        self.state().written.clone()
    }

    /// Lines written so far, in order
    pub fn written_lines(&self) -> Vec<String> {
        self.state()
            .written
            .iter()
            .filter_map(|w| match w {
                Written::Line(l) => Some(l.clone()),
                Written::Raw(_) => None,
            })
            .collect()
    }

    /// Raw writes so far, in order
    pub fn written_raw(&self) -> Vec<Vec<u8>> {
        self.state()
            .written
            .iter()
            .filter_map(|w| match w {
                Written::Raw(b) => Some(b.clone()),
                Written::Line(_) => None,
            })
            .collect()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn write(&self, item: Written) -> Result<(), ProtocolError> {
        let mut state = self.state();
        state.check_open()?;
        if let Some(message) = &state.write_failure {
            return Err(ProtocolError::TransportFailure(message.clone()));
        }
        let at = Instant::now() + state.reply_delay;
        match &item {
            Written::Line(line) => {
                if let Some(lines) = state.line_replies.get(line).cloned() {
                    for l in lines {
                        state.enqueue(at, Inbound::Line(l));
                    }
                }
            }
            Written::Raw(bytes) => {
                if let Some(reply) = state.raw_replies.get(bytes).cloned() {
                    for b in reply {
                        state.enqueue(at, Inbound::Byte(b));
                    }
                }
            }
        }
        state.written.push(item);
        drop(state);
        self.shared.readable.notify_all();
        Ok(())
    }

    /// Wait until the front inbound item is due, then hand it to `take`
    fn read<T>(
        &self,
        timeout: Duration,
        mut take: impl FnMut(&mut ScriptState) -> Option<T>,
    ) -> Result<Option<T>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            state.check_open()?;
            if let Some(message) = &state.read_failure {
                return Err(ProtocolError::TransportFailure(message.clone()));
            }

            let now = Instant::now();
            let due = state.inbound.front().map(|(at, _)| *at);
            if matches!(due, Some(at) if at <= now) {
                if let Some(value) = take(&mut *state) {
                    return Ok(Some(value));
                }
                continue;
            }
            if now >= deadline {
                return Ok(None);
            }

            let wake = due.map_or(deadline, |at| at.min(deadline));
            let (guard, _) = self
                .shared
                .readable
                .wait_timeout(state, wake.saturating_duration_since(now))
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }
}

impl Transport for ScriptedTransport {
    fn write_line(&self, line: &str) -> Result<(), ProtocolError> {
        self.write(Written::Line(line.to_string()))
    }

    fn read_line(&self, timeout: Duration) -> Result<Option<String>, ProtocolError> {
        self.read(timeout, |state| match state.inbound.pop_front() {
            Some((_, Inbound::Line(line))) => Some(line),
            // Stray binary data is noise to a line reader
            Some((_, Inbound::Byte(_))) | None => None,
        })
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.write(Written::Raw(bytes.to_vec()))
    }

    fn read_raw_byte(&self, timeout: Duration) -> Result<Option<u8>, ProtocolError> {
        self.read(timeout, |state| match state.inbound.pop_front() {
            Some((_, Inbound::Byte(b))) => Some(b),
            Some((at, Inbound::Line(line))) => {
                // A line read in raw mode arrives as its bytes plus '\n'
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                let first = bytes[0];
                for b in bytes.into_iter().skip(1).rev() {
                    state.inbound.push_front((at, Inbound::Byte(b)));
                }
                Some(first)
            }
            None => None,
        })
    }

    fn close(&self) -> Result<(), ProtocolError> {
        self.state().closed = true;
        self.shared.readable.notify_all();
        Ok(())
    }
}
