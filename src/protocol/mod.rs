//! Wire format of the ordering protocol.
//!
//! Everything that lands on a channel's partition is a [`KafkaMessage`]: a
//! protobuf tagged union with exactly three variants. The field tags are
//! normative; replicas of the same channel must frame byte-identically, so
//! the messages are written out by hand instead of being generated, with the
//! tags pinned in the derive attributes.

use prost::Message;

/// The envelope every broker record carries. Decoders ignore variants they
/// do not recognize, which leaves room to add message types later.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KafkaMessage {
    #[prost(oneof = "kafka_message::Type", tags = "1, 2, 3")]
    pub r#type: Option<kafka_message::Type>,
}

pub mod kafka_message {
    /// Exactly one of these is set per broker record.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "1")]
        Regular(super::KafkaMessageRegular),
        #[prost(message, tag = "2")]
        TimeToCut(super::KafkaMessageTimeToCut),
        #[prost(message, tag = "3")]
        Connect(super::KafkaMessageConnect),
    }
}

/// A client envelope in transit, opaque to the consenter.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KafkaMessageRegular {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

/// A proposal to cut the block with the given height now.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KafkaMessageTimeToCut {
    #[prost(uint64, tag = "1")]
    pub block_number: u64,
}

/// Bootstrap marker that materializes the partition on the broker.
/// Always ignored on consumption.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KafkaMessageConnect {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

/// Orderer metadata embedded in every written block: the partition offset of
/// the record whose consumption triggered the cut. Restart resumes at
/// `last_offset_persisted + 1`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KafkaMetadata {
    #[prost(int64, tag = "1")]
    pub last_offset_persisted: i64,
}

/// A serialized transaction as accepted at broadcast ingress.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

pub fn connect_message() -> KafkaMessage {
    KafkaMessage {
        r#type: Some(kafka_message::Type::Connect(KafkaMessageConnect {
            payload: vec![],
        })),
    }
}

pub fn time_to_cut_message(block_number: u64) -> KafkaMessage {
    KafkaMessage {
        r#type: Some(kafka_message::Type::TimeToCut(KafkaMessageTimeToCut {
            block_number,
        })),
    }
}

pub fn regular_message(payload: Vec<u8>) -> KafkaMessage {
    KafkaMessage {
        r#type: Some(kafka_message::Type::Regular(KafkaMessageRegular {
            payload,
        })),
    }
}

/// Deterministic framing. Prost encoding cannot fail, so unlike the usual
/// marshal-or-panic helpers this is total.
pub fn marshal(message: &impl Message) -> Vec<u8> {
    message.encode_to_vec()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_time_to_cut_framing_is_stable() {
        // Tag 2 wraps the proposal; replicas must agree on these bytes.
        let encoded = marshal(&time_to_cut_message(5));
        assert_eq!(encoded, vec![0x12, 0x02, 0x08, 0x05]);
    }

    #[test]
    fn test_connect_framing_is_stable() {
        let encoded = marshal(&connect_message());
        assert_eq!(encoded, vec![0x1a, 0x00]);
    }

    #[test]
    fn test_regular_carries_payload() {
        let encoded = marshal(&regular_message(b"abc".to_vec()));
        let decoded = KafkaMessage::decode(encoded.as_slice()).unwrap();
        match decoded.r#type {
            Some(kafka_message::Type::Regular(regular)) => {
                assert_eq!(regular.payload, b"abc");
            }
            other => panic!("decoded the wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_variant_decodes_to_none() {
        // A record framed by a future version with oneof tag 4. Today's
        // decoder must accept it and report no known variant.
        let foreign = vec![0x22, 0x02, 0x08, 0x01];
        let decoded = KafkaMessage::decode(foreign.as_slice()).unwrap();
        assert_eq!(decoded.r#type, None);
    }

    #[test]
    fn test_metadata_survives_the_ledger() {
        let encoded = marshal(&KafkaMetadata {
            last_offset_persisted: 42,
        });
        let decoded = KafkaMetadata::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded.last_offset_persisted, 42);
    }
}
