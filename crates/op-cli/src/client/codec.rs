//! A tonic codec for messages whose schema is only known at runtime.

use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Encodes/decodes [`DynamicMessage`]s against a method's input and
/// output descriptors.
#[derive(Clone)]
pub struct DynamicCodec {
    method: MethodDescriptor,
}

impl DynamicCodec {
    /// Builds a codec for one method.
    #[must_use]
    pub fn new(method: MethodDescriptor) -> Self {
        Self { method }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            descriptor: self.method.output(),
        }
    }
}

/// Encodes a dynamic request message into the wire buffer.
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|err| Status::internal(format!("encode request: {err}")))
    }
}

/// Decodes a wire buffer into a dynamic response message.
pub struct DynamicDecoder {
    descriptor: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let message = DynamicMessage::decode(self.descriptor.clone(), src)
            .map_err(|err| Status::internal(format!("decode response: {err}")))?;
        Ok(Some(message))
    }
}
