//! Wire codec boundary
//!
//! The stream moves whole binary frames; what is inside a frame is the
//! caller's business. [`Codec`] is the serialize/parse pair supplied at
//! construction, and [`MsgPackCodec`] is the batteries-included MessagePack
//! implementation.

use crate::error::StreamError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Serialize/parse pair for one message per binary transport frame.
pub trait Codec: Send + 'static {
    type Out: Send + 'static;
    type In: Send + 'static;

    fn encode(&self, msg: &Self::Out) -> Result<Vec<u8>, StreamError>;
    fn decode(&self, frame: &[u8]) -> Result<Self::In, StreamError>;
}

/// MessagePack codec over serde types.
pub struct MsgPackCodec<Out, In> {
    _marker: PhantomData<fn(Out) -> In>,
}

impl<Out, In> MsgPackCodec<Out, In> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<Out, In> Default for MsgPackCodec<Out, In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Out, In> Codec for MsgPackCodec<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    type Out = Out;
    type In = In;

    fn encode(&self, msg: &Out) -> Result<Vec<u8>, StreamError> {
        rmp_serde::to_vec_named(msg)
            .map_err(|e| StreamError::Parse(format!("Failed to encode message: {}", e)))
    }

    fn decode(&self, frame: &[u8]) -> Result<In, StreamError> {
        rmp_serde::from_slice(frame)
            .map_err(|e| StreamError::Parse(format!("Failed to decode message: {}", e)))
    }
}
