//! Value-stream framing over the byte stream store.
//!
//! Byte streams pipe raw chunks. Value streams frame each serialized value
//! (`[u32 BE length][format-prefixed payload]`); readers reassemble frames
//! from arbitrary chunk boundaries and accept the legacy newline-delimited
//! mode for historical data.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

use windlass_codec::{
    dehydrate, encode_frame, hydrate, Boundary, CodecError, FrameDecoder, Value,
};
use windlass_engine::StreamWriter;
use windlass_world::WorldError;

/// Errors from stream readers.
#[derive(Debug, thiserror::Error)]
pub enum StreamReadError {
    #[error(transparent)]
    World(#[from] WorldError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Writer that frames and serializes one value per chunk.
pub struct ValueStreamWriter {
    inner: StreamWriter,
    boundary: Boundary,
}

impl ValueStreamWriter {
    #[must_use]
    pub fn new(inner: StreamWriter, boundary: Boundary) -> Self {
        Self { inner, boundary }
    }

    /// Serializes and buffers one value.
    pub fn write(&self, value: &Value) -> Result<(), CodecError> {
        let payload = dehydrate(value, self.boundary, "stream chunk")?;
        self.inner.write(Bytes::from(encode_frame(&payload)));
        Ok(())
    }

    /// Flushes buffered frames and closes the stream.
    pub async fn close(&self) -> Result<(), WorldError> {
        self.inner.close().await
    }
}

/// Tail reader over raw byte chunks.
pub struct ByteStreamReader {
    inner: BoxStream<'static, Result<Bytes, WorldError>>,
}

impl ByteStreamReader {
    #[must_use]
    pub fn new(inner: BoxStream<'static, Result<Bytes, WorldError>>) -> Self {
        Self { inner }
    }

    /// Next chunk, or `None` once the stream is closed and drained.
    pub async fn next(&mut self) -> Option<Result<Bytes, StreamReadError>> {
        self.inner
            .next()
            .await
            .map(|chunk| chunk.map_err(Into::into))
    }

    /// Collects the remaining chunks into one buffer.
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>, StreamReadError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

/// Tail reader that reassembles frames and hydrates one value per frame.
pub struct ValueStreamReader {
    inner: BoxStream<'static, Result<Bytes, WorldError>>,
    decoder: FrameDecoder,
    boundary: Boundary,
    done: bool,
}

impl ValueStreamReader {
    #[must_use]
    pub fn new(inner: BoxStream<'static, Result<Bytes, WorldError>>, boundary: Boundary) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            boundary,
            done: false,
        }
    }

    /// Next value, or `None` once the stream is closed and every frame is
    /// decoded.
    pub async fn next(&mut self) -> Option<Result<Value, StreamReadError>> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Some(self.hydrate_frame(&frame)),
                Ok(None) => {}
                Err(e) => return Some(Err(e.into())),
            }

            if self.done {
                return match self.decoder.finish() {
                    Ok(Some(frame)) => Some(self.hydrate_frame(&frame)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e.into())),
                };
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(e)) => return Some(Err(e.into())),
                None => self.done = true,
            }
        }
    }

    /// Collects the remaining values.
    pub async fn collect_values(mut self) -> Result<Vec<Value>, StreamReadError> {
        let mut out = Vec::new();
        while let Some(value) = self.next().await {
            out.push(value?);
        }
        Ok(out)
    }

    fn hydrate_frame(&self, frame: &[u8]) -> Result<Value, StreamReadError> {
        Ok(hydrate(frame, self.boundary, "stream chunk")?)
    }
}
