use bytes::BytesMut;
use mqttbytes::v4::Packet;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("MQTT protocol error {0}")]
    ProtocolError(mqttbytes::Error),
}

impl From<mqttbytes::Error> for CodecError {
    fn from(v: mqttbytes::Error) -> Self {
        Self::ProtocolError(v)
    }
}

/// Frames MQTT 3.1.1 packets out of a byte stream and writes them back into one.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_packet_size: usize,
}

impl Codec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match mqttbytes::check(src.iter(), self.max_packet_size) {
            Ok(_header) => {
                let res = mqttbytes::v4::read(src, self.max_packet_size)?;
                Ok(Some(res))
            }
            Err(mqttbytes::Error::InsufficientBytes(x)) => {
                if src.capacity() < x {
                    src.reserve(x - src.capacity());
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Encoder<&Packet> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Packet::Connect(p) => p.write(dst)?,
            Packet::ConnAck(p) => p.write(dst)?,
            Packet::Publish(p) => p.write(dst)?,
            Packet::PubAck(p) => p.write(dst)?,
            Packet::PubRec(p) => p.write(dst)?,
            Packet::PubRel(p) => p.write(dst)?,
            Packet::PubComp(p) => p.write(dst)?,
            Packet::Subscribe(p) => p.write(dst)?,
            Packet::SubAck(p) => p.write(dst)?,
            Packet::Unsubscribe(p) => p.write(dst)?,
            Packet::UnsubAck(p) => p.write(dst)?,
            Packet::PingReq => mqttbytes::v4::PingReq.write(dst)?,
            Packet::PingResp => mqttbytes::v4::PingResp.write(dst)?,
            Packet::Disconnect => mqttbytes::v4::Disconnect.write(dst)?,
        };

        Ok(())
    }
}
