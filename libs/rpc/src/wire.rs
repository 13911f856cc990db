//! Length-prefixed, JSON-encoded request/reply envelopes, carried over a
//! `LengthDelimitedCodec` the same way the headless client's IPC transport
//! frames its messages.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: u64,
    pub method: String,
    pub payload: serde_json::Value,
}

/// `Err` is reserved for genuine transport/panic conditions — a
/// business-level failure is a normal `Ok` reply whose payload happens to
/// carry an error field the handler set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireReply {
    pub id: u64,
    pub result: Result<serde_json::Value, String>,
}

pub struct JsonCodec<D, E> {
    inner: LengthDelimitedCodec,
    _decode: std::marker::PhantomData<D>,
    _encode: std::marker::PhantomData<E>,
}

impl<D, E> Default for JsonCodec<D, E> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _decode: std::marker::PhantomData,
            _encode: std::marker::PhantomData,
        }
    }
}

impl<D: serde::de::DeserializeOwned, E> Decoder for JsonCodec<D, E> {
    type Item = D;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&frame)?;
        Ok(Some(value))
    }
}

impl<D, E: Serialize> Encoder<&E> for JsonCodec<D, E> {
    type Error = anyhow::Error;

    fn encode(&mut self, item: &E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = serde_json::to_vec(item)?;
        self.inner.encode(bytes.into(), dst)?;
        Ok(())
    }
}
