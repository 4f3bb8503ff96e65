//! Capture of the child's stderr stream
//!
//! The stream is read continuously so a chatty child never blocks on a full pipe,
//! but only the most recent bytes are kept and they are handed over once, at shutdown.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

#[derive(Debug)]
struct TailBuffer {
    bytes: Vec<u8>,
    dropped: usize,
    cap: usize,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            dropped: 0,
            cap,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.cap {
            let excess = self.bytes.len() - self.cap;
            self.bytes.drain(..excess);
            self.dropped += excess;
        }
    }

    fn render(&self) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        if self.dropped == 0 {
            return text.into_owned();
        }
        format!("[{} earlier bytes dropped]\n{text}", self.dropped)
    }
}

#[derive(Debug)]
pub struct DiagnosticsCollector {
    buffer: Arc<Mutex<TailBuffer>>,
    task: JoinHandle<()>,
}

impl DiagnosticsCollector {
    pub fn spawn<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::spawn_with_cap(reader, MAX_DIAGNOSTIC_BYTES)
    }

    pub fn spawn_with_cap<R>(mut reader: R, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(TailBuffer::new(cap)));
        let sink = Arc::clone(&buffer);

        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(read) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(&chunk[..read]),
                    Err(err) => {
                        debug!(error = %err, "stderr read failed");
                        break;
                    }
                }
            }
        });

        Self { buffer, task }
    }

    /// Waits up to `wait` for the stream to reach end-of-file, then returns what was captured.
    pub async fn finish(mut self, wait: Duration) -> String {
        match tokio::time::timeout(wait, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "stderr drain task failed"),
            Err(_) => {
                warn!(
                    wait_ms = wait.as_millis(),
                    "stderr still open after child exit; returning partial diagnostics"
                );
                self.task.abort();
            }
        }

        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.render()
    }
}
