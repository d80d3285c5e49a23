//! The packet model consumed by the session.
//!
//! Packets are the closed [`Packet`] enum of MQTT 3.1.1 control packets. Serialization yields an
//! ordered list of byte ranges which the session flattens into a single buffer before handing it to
//! a [`Transport`](crate::transport::Transport).

use std::fmt;

use bytes::{Bytes, BytesMut};
pub use mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Login, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, SubAck, Subscribe, SubscribeFilter, UnsubAck, Unsubscribe,
};
use tokio_util::codec::Encoder;

use crate::codec::{Codec, CodecError};

/// Field-less tag of a [`Packet`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Connect,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

impl PacketKind {
    pub fn of(packet: &Packet) -> Self {
        match packet {
            Packet::Connect(_) => Self::Connect,
            Packet::ConnAck(_) => Self::ConnAck,
            Packet::Publish(_) => Self::Publish,
            Packet::PubAck(_) => Self::PubAck,
            Packet::PubRec(_) => Self::PubRec,
            Packet::PubRel(_) => Self::PubRel,
            Packet::PubComp(_) => Self::PubComp,
            Packet::Subscribe(_) => Self::Subscribe,
            Packet::SubAck(_) => Self::SubAck,
            Packet::Unsubscribe(_) => Self::Unsubscribe,
            Packet::UnsubAck(_) => Self::UnsubAck,
            Packet::PingReq => Self::PingReq,
            Packet::PingResp => Self::PingResp,
            Packet::Disconnect => Self::Disconnect,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnAck => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::PubAck => "PUBACK",
            Self::PubRec => "PUBREC",
            Self::PubRel => "PUBREL",
            Self::PubComp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::SubAck => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::UnsubAck => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The packet identifier carried by `packet`, if its kind has one.
///
/// A QoS 0 publish never carries an identifier, so `None` is returned for it.
pub fn packet_id(packet: &Packet) -> Option<u16> {
    match packet {
        Packet::Publish(p) if p.pkid != 0 => Some(p.pkid),
        Packet::PubAck(p) => Some(p.pkid),
        Packet::PubRec(p) => Some(p.pkid),
        Packet::PubRel(p) => Some(p.pkid),
        Packet::PubComp(p) => Some(p.pkid),
        Packet::Subscribe(p) => Some(p.pkid),
        Packet::SubAck(p) => Some(p.pkid),
        Packet::Unsubscribe(p) => Some(p.pkid),
        Packet::UnsubAck(p) => Some(p.pkid),
        _ => None,
    }
}

/// Serialize `packet` into an ordered sequence of byte ranges.
///
/// A publish is split into its header (fixed header, topic and packet identifier) and its payload,
/// the latter sharing the payload's allocation. Every other kind yields a single range.
pub fn byte_ranges(packet: &Packet) -> Result<Vec<Bytes>, CodecError> {
    let mut buf = BytesMut::new();
    Codec::default().encode(packet, &mut buf)?;

    match packet {
        Packet::Publish(publish) if !publish.payload.is_empty() => {
            let head_len = buf.len() - publish.payload.len();
            let head = buf.split_to(head_len).freeze();
            Ok(vec![head, publish.payload.clone()])
        }
        _ => Ok(vec![buf.freeze()]),
    }
}

/// Concatenate `ranges` in order into one contiguous buffer.
pub fn flatten(ranges: &[Bytes]) -> BytesMut {
    let total = ranges.iter().map(Bytes::len).sum();
    let mut flat = BytesMut::with_capacity(total);
    for range in ranges {
        flat.extend_from_slice(range);
    }
    flat
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use mqttbytes::QoS;

    use super::*;

    #[test]
    fn flatten_concatenates_in_order() {
        let ranges = [
            Bytes::from_static(b""),
            Bytes::from_static(b"abc"),
            Bytes::from_static(b""),
            Bytes::from_static(b"d"),
            Bytes::from(vec![0xffu8; 300]),
            Bytes::from_static(b""),
        ];
        let flat = flatten(&ranges);

        let mut expected = b"abcd".to_vec();
        expected.extend_from_slice(&[0xff; 300]);
        assert_eq!(&flat[..], &expected[..]);
    }

    #[test]
    fn flatten_of_nothing_is_empty() {
        assert!(flatten(&[]).is_empty());
        assert!(flatten(&[Bytes::new(), Bytes::new()]).is_empty());
    }

    #[test]
    fn publish_splits_header_from_payload() {
        let mut publish = Publish::new("topic2", QoS::AtLeastOnce, b"payload2".to_vec());
        publish.pkid = 12;
        let packet = Packet::Publish(publish.clone());

        let ranges = byte_ranges(&packet).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1], publish.payload);

        let mut whole = BytesMut::new();
        publish.write(&mut whole).unwrap();
        assert_eq!(&flatten(&ranges)[..], &whole[..]);
    }

    #[test]
    fn control_packets_are_one_range() {
        for packet in [
            Packet::PingReq,
            Packet::Disconnect,
            Packet::PubRel(PubRel::new(3)),
            Packet::Publish(Publish::new("empty", QoS::AtMostOnce, Vec::new())),
        ] {
            let ranges = byte_ranges(&packet).unwrap();
            assert_eq!(ranges.len(), 1, "{:?}", packet);
        }
    }

    #[test]
    fn packet_ids() {
        assert_eq!(packet_id(&Packet::PubComp(PubComp::new(9))), Some(9));
        assert_eq!(
            packet_id(&Packet::Publish(Publish::new("t", QoS::AtMostOnce, vec![1]))),
            None
        );
        assert_eq!(packet_id(&Packet::PingResp), None);
        assert_eq!(PacketKind::of(&Packet::PingReq), PacketKind::PingReq);
        assert_eq!(PacketKind::PubRec.to_string(), "PUBREC");
    }
}
