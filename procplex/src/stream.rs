//! Async Event Stream Adapter
//!
//! Bridges listener callbacks onto a tokio channel so async code can consume
//! a child's lifecycle as a sequence of [`ProcessEvent`]s, and feed its stdin
//! through a [`StdinWriter`] queue.
//!
//! # Example:
//! ```no_run
//! # async fn demo() -> Result<(), procplex::SpawnError> {
//! use procplex::{spawn_streaming, ProcessBuilder, ProcessEvent};
//!
//! let mut child = spawn_streaming(ProcessBuilder::new(["/bin/cat"]))?;
//! child.stdin.write(b"hello".to_vec());
//! child.stdin.close();
//! while let Some(event) = child.events.recv().await {
//!     if let ProcessEvent::Exit { code } = event {
//!         assert_eq!(code, 0);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::buffer::StdinBuffer;
use crate::builder::ProcessBuilder;
use crate::error::SpawnError;
use crate::listener::ProcessListener;
use crate::process::ProcessHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One observable step in a child's life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProcessEvent {
    Started {
        pid: u32,
    },
    Stdout {
        #[serde(with = "lossy_text")]
        data: Vec<u8>,
    },
    Stderr {
        #[serde(with = "lossy_text")]
        data: Vec<u8>,
    },
    StdoutClosed,
    StderrClosed,
    Exit {
        code: i32,
    },
}

/// Byte payloads are rendered as (lossy) UTF-8 text in serialized form.
mod lossy_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}

#[derive(Debug, Default)]
struct InputState {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already copied into the stdin buffer.
    offset: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct InputQueue {
    state: Mutex<InputState>,
}

impl InputQueue {
    /// Copy queued bytes into `buffer`. Returns `false` once the queue is
    /// closed and empty.
    fn fill(&self, buffer: &mut StdinBuffer) -> bool {
        let mut state = self.state.lock();
        while buffer.remaining() > 0 {
            let offset = state.offset;
            let Some(front) = state.chunks.front() else {
                break;
            };
            let copied = buffer.put(&front[offset..]);
            if offset + copied == front.len() {
                state.chunks.pop_front();
                state.offset = 0;
            } else {
                state.offset += copied;
            }
        }
        !(state.closed && state.chunks.is_empty())
    }
}

/// Listener that forwards every callback to an unbounded channel.
pub struct StreamingListener {
    events: mpsc::UnboundedSender<ProcessEvent>,
    input: Arc<InputQueue>,
}

impl StreamingListener {
    fn send(&self, event: ProcessEvent) {
        // The receiver may already be gone; the child keeps running regardless.
        let _ = self.events.send(event);
    }
}

impl ProcessListener for StreamingListener {
    fn on_start(&mut self, process: &ProcessHandle) {
        self.send(ProcessEvent::Started { pid: process.pid() });
    }

    fn on_stdout(&mut self, buffer: &[u8]) {
        if buffer.is_empty() {
            self.send(ProcessEvent::StdoutClosed);
        } else {
            self.send(ProcessEvent::Stdout { data: buffer.to_vec() });
        }
    }

    fn on_stderr(&mut self, buffer: &[u8]) {
        if buffer.is_empty() {
            self.send(ProcessEvent::StderrClosed);
        } else {
            self.send(ProcessEvent::Stderr { data: buffer.to_vec() });
        }
    }

    fn on_stdin_ready(&mut self, buffer: &mut StdinBuffer) -> bool {
        self.input.fill(buffer)
    }

    fn on_exit(&mut self, exit_code: i32) {
        self.send(ProcessEvent::Exit { code: exit_code });
    }
}

/// Queue feeding a streaming child's stdin. Dropping it closes stdin.
#[derive(Debug)]
pub struct StdinWriter {
    handle: ProcessHandle,
    input: Arc<InputQueue>,
}

impl StdinWriter {
    /// Queue `data` for the child. Ignored once the writer is closed.
    pub fn write(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        {
            let mut state = self.input.state.lock();
            if state.closed {
                return;
            }
            state.chunks.push_back(data);
        }
        self.handle.want_write();
    }

    /// Close stdin once everything queued so far has been written.
    pub fn close(&self) {
        {
            let mut state = self.input.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.handle.want_write();
    }
}

impl Drop for StdinWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Everything a streaming child produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub code: Option<i32>,
}

/// A child driven through the async adapter.
#[derive(Debug)]
pub struct StreamingProcess {
    pub handle: ProcessHandle,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
    pub stdin: StdinWriter,
}

impl StreamingProcess {
    /// Close stdin and gather the remaining output until the child exits.
    pub async fn collect(mut self) -> CollectedOutput {
        self.stdin.close();
        let mut output = CollectedOutput::default();
        while let Some(event) = self.events.recv().await {
            match event {
                ProcessEvent::Stdout { data } => output.stdout.extend_from_slice(&data),
                ProcessEvent::Stderr { data } => output.stderr.extend_from_slice(&data),
                ProcessEvent::Exit { code } => output.code = Some(code),
                _ => {}
            }
        }
        output
    }
}

/// Launch `builder` with a [`StreamingListener`].
pub fn spawn_streaming(builder: ProcessBuilder) -> Result<StreamingProcess, SpawnError> {
    let (tx, events) = mpsc::unbounded_channel();
    let input = Arc::new(InputQueue::default());
    let listener = StreamingListener {
        events: tx,
        input: Arc::clone(&input),
    };

    let handle = builder.try_start(listener)?;
    Ok(StreamingProcess {
        stdin: StdinWriter {
            handle: handle.clone(),
            input,
        },
        handle,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&ProcessEvent::Stdout { data: b"hi\n".to_vec() }).unwrap();
        assert_eq!(json, r#"{"event":"stdout","data":"hi\n"}"#);

        let json = serde_json::to_string(&ProcessEvent::Exit { code: 3 }).unwrap();
        assert_eq!(json, r#"{"event":"exit","code":3}"#);

        let back: ProcessEvent = serde_json::from_str(r#"{"event":"stderr_closed"}"#).unwrap();
        assert_eq!(back, ProcessEvent::StderrClosed);
    }

    #[test]
    fn test_queue_splits_large_chunks() {
        let queue = InputQueue::default();
        queue.state.lock().chunks.push_back(vec![7u8; 10]);

        let mut buffer = StdinBuffer::new(4);
        assert!(queue.fill(&mut buffer));
        assert_eq!(buffer.len(), 4);
        assert_eq!(queue.state.lock().offset, 4);

        let mut buffer = StdinBuffer::new(8);
        assert!(queue.fill(&mut buffer));
        assert_eq!(buffer.len(), 6);
        assert!(queue.state.lock().chunks.is_empty());
    }

    #[test]
    fn test_queue_reports_end_after_close() {
        let queue = InputQueue::default();
        {
            let mut state = queue.state.lock();
            state.chunks.push_back(b"tail".to_vec());
            state.closed = true;
        }
        let mut buffer = StdinBuffer::new(16);
        assert!(!queue.fill(&mut buffer));
        assert_eq!(buffer.len(), 4);
    }

    #[tokio::test]
    async fn test_streaming_echo() {
        let child = spawn_streaming(ProcessBuilder::new(["/bin/cat"])).unwrap();
        child.stdin.write(b"one ".to_vec());
        child.stdin.write(b"two".to_vec());
        let output = child.collect().await;
        assert_eq!(output.stdout, b"one two");
        assert_eq!(output.code, Some(0));
    }

    #[tokio::test]
    async fn test_streaming_event_order() {
        let mut child = spawn_streaming(ProcessBuilder::new(["/bin/sh", "-c", "echo out; echo err >&2"])).unwrap();
        child.stdin.close();

        let mut events = Vec::new();
        while let Some(event) = child.events.recv().await {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(ProcessEvent::Started { .. })));
        assert_eq!(events.last(), Some(&ProcessEvent::Exit { code: 0 }));
        assert!(events.contains(&ProcessEvent::StdoutClosed));
        assert!(events.contains(&ProcessEvent::StderrClosed));
        assert!(events.contains(&ProcessEvent::Stderr { data: b"err\n".to_vec() }));
    }
}
