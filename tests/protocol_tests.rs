//! Framing and packet table tests

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use instance_world::{
        codec,
        protocol::{kinds, node_delta, Packet, PacketKind},
        types::{InstanceId, NetworkConfig},
        ProtocolError,
    };

    const MAX: u32 = 16 * 1024 * 1024;

    fn frame(len: u32, ptype: u8, subtype: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(len);
        buf.put_u8(ptype);
        buf.put_u8(subtype);
        buf.put_slice(payload);
        buf.to_vec()
    }

    // -----------------------------------------------------------------------
    // Frame layout
    // -----------------------------------------------------------------------

    #[test]
    fn encode_layout() {
        let bytes = codec::encode(&Packet::from_parts(7, 3, &b"abc"[..])).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 5, 7, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn decode_round_trip() {
        let bytes = codec::encode(&Packet::from_parts(7, 3, &b"abc"[..])).unwrap();
        let packet = codec::decode_frame(&bytes, MAX).unwrap();

        assert_eq!(packet.kind, PacketKind::new(7, 3));
        assert_eq!(&packet.payload[..], b"abc");
    }

    #[test]
    fn empty_payload_is_valid() {
        let packet = codec::decode_frame(&frame(2, 1, 0, b""), MAX).unwrap();
        assert_eq!(packet.kind, kinds::ACK);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn short_length_is_rejected() {
        let err = codec::decode_frame(&[0, 0, 0, 1, 9], MAX).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooShort(1)));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let err = codec::decode_frame(&frame(100, 0, 0, b""), 64).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(100)));
    }

    #[test]
    fn partial_frame_is_truncated() {
        let err = codec::decode_frame(&frame(5, 7, 3, b"a"), MAX).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                expected: 9,
                actual: 7
            }
        ));
    }

    #[test]
    fn try_decode_waits_for_whole_frame_then_splits() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&frame(3, 0, 0, b"x"));
        stream.extend_from_slice(&frame(4, 1, 0, b"ok"));

        let mut buf = BytesMut::from(&stream[..5]);
        assert!(codec::try_decode(&mut buf, MAX).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        let mut buf = stream;
        let first = codec::try_decode(&mut buf, MAX).unwrap().unwrap();
        let second = codec::try_decode(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(first.kind, kinds::PING);
        assert_eq!(&second.payload[..], b"ok");
        assert!(buf.is_empty());
    }

    #[test]
    fn default_max_frame_len() {
        assert_eq!(NetworkConfig::default().max_frame_len, MAX);
        assert_eq!(NetworkConfig::with_event_buffer(0).event_buffer, 1024);
    }

    // -----------------------------------------------------------------------
    // Packet table
    // -----------------------------------------------------------------------

    #[test]
    fn reserved_kinds() {
        assert_eq!(kinds::PING.key(), 0x0000);
        assert_eq!(kinds::HANDSHAKE.key(), 0x0001);
        assert_eq!(kinds::ACK.key(), 0x0100);
        assert_eq!(kinds::NODE_ADDED.key(), 0x0105);
        assert_eq!(kinds::NODE_EDITED.key(), 0x0106);
        assert_eq!(kinds::NODE_DELETED.key(), 0x0107);
        assert_eq!(kinds::NODE_ADDED.to_string(), "0x01/0x05");
    }

    #[test]
    fn handshake_carries_key() {
        let packet = Packet::handshake("session-1");
        assert_eq!(packet.kind, kinds::HANDSHAKE);
        assert_eq!(&packet.payload[..], b"session-1");
    }

    #[test]
    fn node_delta_layout() {
        assert_eq!(&node_delta::encode(InstanceId(42), &[])[..], b"42");

        let payload = node_delta::encode(
            InstanceId(7),
            &[("Name", &b"Brick"[..]), ("Size", &b"1,1,1"[..])],
        );
        assert_eq!(&payload[..], b"7\x1dName\x1eBrick\x1fSize\x1e1,1,1");
    }

    // -----------------------------------------------------------------------
    // Async stream I/O
    // -----------------------------------------------------------------------

    #[cfg(feature = "net")]
    #[tokio::test]
    async fn read_packet_across_chunks() {
        let bytes = frame(5, 7, 3, b"abc");
        let mut reader = tokio_test::io::Builder::new()
            .read(&bytes[..2])
            .read(&bytes[2..6])
            .read(&bytes[6..])
            .build();

        let packet = codec::read_packet(&mut reader, MAX).await.unwrap().unwrap();
        assert_eq!(packet.kind, PacketKind::new(7, 3));
        assert_eq!(&packet.payload[..], b"abc");

        assert!(codec::read_packet(&mut reader, MAX).await.unwrap().is_none());
    }

    #[cfg(feature = "net")]
    #[tokio::test]
    async fn read_packet_rejects_bad_length() {
        let mut reader = tokio_test::io::Builder::new().read(&[0, 0, 0, 1]).build();
        let err = codec::read_packet(&mut reader, MAX).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooShort(1)));
    }

    #[cfg(feature = "net")]
    #[tokio::test]
    async fn read_packet_reports_torn_header() {
        let mut reader = tokio_test::io::Builder::new().read(&[0, 0]).build();
        let err = codec::read_packet(&mut reader, MAX).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[cfg(feature = "net")]
    #[tokio::test]
    async fn write_packet_emits_one_frame() {
        let mut writer = tokio_test::io::Builder::new()
            .write(&frame(6, 0, 0, b"ping"))
            .build();
        codec::write_packet(&mut writer, &Packet::new(kinds::PING, &b"ping"[..]))
            .await
            .unwrap();
    }
}
