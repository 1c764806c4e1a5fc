//! Buffered stream writer.
//!
//! Writers batch chunks for a short flush window (~10 ms) and flush as a
//! batch when the window elapses or the stream closes. A failed flush puts
//! the chunks back, so a later flush (or a retried `close`) re-sends them —
//! no data is lost on transient store failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use windlass_core::{RunId, StreamId};
use windlass_world::{World, WorldError};

/// Default flush window.
pub const FLUSH_WINDOW: Duration = Duration::from_millis(10);

struct WriterShared {
    world: Arc<dyn World>,
    name: StreamId,
    run_id: RunId,
    buf: Mutex<Vec<Bytes>>,
    notify: Notify,
    closing: AtomicBool,
}

impl WriterShared {
    /// Flushes the buffer. On failure the chunks are restored in order.
    async fn flush(&self) -> Result<(), WorldError> {
        let batch = {
            let mut buf = self.buf.lock();
            if buf.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buf)
        };

        match self
            .world
            .write_to_stream_multi(self.name, self.run_id, batch.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut buf = self.buf.lock();
                let mut restored = batch;
                restored.extend(buf.drain(..));
                *buf = restored;
                Err(err)
            }
        }
    }
}

/// Append-only writer with a flush window.
pub struct StreamWriter {
    shared: Arc<WriterShared>,
    flusher: JoinHandle<()>,
}

impl StreamWriter {
    /// Creates a writer with the default flush window.
    pub fn new(world: Arc<dyn World>, name: StreamId, run_id: RunId) -> Self {
        Self::with_flush_window(world, name, run_id, FLUSH_WINDOW)
    }

    /// Creates a writer with an explicit flush window.
    pub fn with_flush_window(
        world: Arc<dyn World>,
        name: StreamId,
        run_id: RunId,
        window: Duration,
    ) -> Self {
        let shared = Arc::new(WriterShared {
            world,
            name,
            run_id,
            buf: Mutex::new(Vec::new()),
            notify: Notify::new(),
            closing: AtomicBool::new(false),
        });

        let flusher = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                loop {
                    shared.notify.notified().await;
                    if shared.closing.load(Ordering::SeqCst) {
                        return;
                    }
                    tokio::time::sleep(window).await;
                    if shared.closing.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Err(err) = shared.flush().await {
                        warn!(stream = %shared.name, %err, "stream flush failed, retaining chunks");
                    }
                }
            }
        });

        Self { shared, flusher }
    }

    /// The stream being written.
    #[must_use]
    pub fn name(&self) -> StreamId {
        self.shared.name
    }

    /// Buffers one chunk; it becomes durable at the next flush.
    pub fn write(&self, chunk: Bytes) {
        self.shared.buf.lock().push(chunk);
        self.shared.notify.notify_one();
    }

    /// Flushes immediately, bypassing the window.
    pub async fn flush(&self) -> Result<(), WorldError> {
        self.shared.flush().await
    }

    /// Flushes anything buffered, then closes the underlying stream. On a
    /// flush failure the buffered chunks are retained and the stream stays
    /// open; calling `close` again retries.
    pub async fn close(&self) -> Result<(), WorldError> {
        self.shared.flush().await?;
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        self.shared
            .world
            .close_stream(self.shared.name, self.shared.run_id)
            .await
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}
