use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tonic::codec::{BufferSettings, Codec, Decoder, Encoder};
use tonic::Status;

/// A gRPC codec for descriptor-driven messages.
///
/// Works with runtime-resolved message descriptors instead of generated
/// types, which is what lets both engines serve and invoke methods known
/// only from a descriptor pool. Directionality is explicit so the same type
/// serves the client (encode = input, decode = output) and the server
/// (encode = output, decode = input).
#[derive(Clone)]
pub struct DynamicCodec {
    encode_desc: MessageDescriptor,
    decode_desc: MessageDescriptor,
}

impl DynamicCodec {
    /// Client-side codec for a method: encodes requests, decodes responses.
    pub fn client(input: MessageDescriptor, output: MessageDescriptor) -> DynamicCodec {
        DynamicCodec {
            encode_desc: input,
            decode_desc: output,
        }
    }

    /// Server-side codec for a method: decodes requests, encodes responses.
    pub fn server(input: MessageDescriptor, output: MessageDescriptor) -> DynamicCodec {
        DynamicCodec {
            encode_desc: output,
            decode_desc: input,
        }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder {
            _desc: self.encode_desc.clone(),
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            desc: self.decode_desc.clone(),
        }
    }
}

/// Encodes DynamicMessage into protobuf wire format.
pub struct DynamicEncoder {
    _desc: MessageDescriptor,
}

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut tonic::codec::EncodeBuf<'_>,
    ) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode message: {e}")))?;
        Ok(())
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

/// Decodes protobuf wire format into DynamicMessage.
pub struct DynamicDecoder {
    desc: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut tonic::codec::DecodeBuf<'_>,
    ) -> Result<Option<Self::Item>, Self::Error> {
        let msg = DynamicMessage::decode(self.desc.clone(), src)
            .map_err(|e| Status::internal(format!("failed to decode message: {e}")))?;
        Ok(Some(msg))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}
