//! Property-based tests using proptest
//!
//! These validate the wire-format invariants across randomly generated
//! inputs: codec round-trips, stream-reassembly idempotence, and checksum
//! positions.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use midea_lan::core::codec::{Frame, FrameType, TransportState};
use midea_lan::core::crypto;
use midea_lan::core::packet::{self, PacketKind};
use midea_lan::protocol::message::{ApplianceMessage, MAX_BODY_LEN};
use proptest::prelude::*;

fn keyed(key: [u8; 32]) -> TransportState {
    let mut state = TransportState::new();
    state.set_tcp_key(key);
    state
}

// Property: every encrypted frame decodes back to its payload under the
// same session key.
proptest! {
    #[test]
    fn prop_frame_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..2048),
        key in any::<[u8; 32]>(),
    ) {
        let mut tx = keyed(key);
        let mut rx = keyed(key);

        let wire = tx.encode_frame(&payload, FrameType::EncryptedRequest)
            .expect("encode never fails with a key");
        rx.feed(&wire);
        let frames = rx.decode_stream().expect("own frames decode");

        prop_assert_eq!(frames, vec![Frame::Message(payload)]);
    }
}

// Property: splitting the wire bytes at arbitrary points yields the same
// frames as one contiguous feed.
proptest! {
    #[test]
    fn prop_reassembly_is_split_invariant(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
        chunk in 1usize..97,
    ) {
        let mut tx = keyed([0u8; 32]);
        let mut wire = Vec::new();
        for p in &payloads {
            wire.extend(tx.encode_frame(p, FrameType::EncryptedRequest).unwrap());
        }

        let mut whole = keyed([0u8; 32]);
        whole.feed(&wire);
        let expected = whole.decode_stream().unwrap();

        let mut pieces = keyed([0u8; 32]);
        let mut collected = Vec::new();
        for part in wire.chunks(chunk) {
            pieces.feed(part);
            collected.extend(pieces.decode_stream().unwrap());
        }

        prop_assert_eq!(collected, expected);
    }
}

// Property: ECB round-trips arbitrary byte strings.
proptest! {
    #[test]
    fn prop_ecb_roundtrip(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let cipher = crypto::encrypt_ecb(&data);
        prop_assert_eq!(cipher.len() % 16, 0);
        prop_assert_eq!(crypto::decrypt_ecb(&cipher).expect("own ciphertext"), data);
    }
}

// Property: the inner envelope round-trips and always carries a valid tag.
proptest! {
    #[test]
    fn prop_inner_packet_roundtrip(
        device_id in any::<u64>(),
        command in prop::collection::vec(any::<u8>(), 1..200),
    ) {
        let raw = packet::build(device_id, &command, PacketKind::Encrypted);

        let tag = crypto::md5_tag(&raw[..raw.len() - 16]);
        prop_assert_eq!(&tag[..], &raw[raw.len() - 16..]);

        let parsed = packet::parse(&raw).expect("own packets parse");
        prop_assert_eq!(parsed.device_id, device_id);
        prop_assert_eq!(parsed.body, command);
    }
}

// Property: serialized appliance messages round-trip across the whole legal
// body range and the trailing byte always equals the checksum of everything
// after the lead byte.
proptest! {
    #[test]
    fn prop_message_checksum_position(
        appliance_type in any::<u8>(),
        version in any::<u8>(),
        message_type in any::<u8>(),
        body in prop::collection::vec(any::<u8>(), 0..=MAX_BODY_LEN),
    ) {
        let message = ApplianceMessage::new(appliance_type, version, message_type, body);
        let raw = message.to_bytes().expect("body within the length limit");

        prop_assert_eq!(raw[1] as usize, raw.len());
        prop_assert_eq!(crypto::sum8(&raw[1..raw.len() - 1]), raw[raw.len() - 1]);
        prop_assert_eq!(ApplianceMessage::parse(&raw).expect("own messages parse"), message);
    }
}

// Property: bodies past the length limit are rejected, never truncated.
proptest! {
    #[test]
    fn prop_oversized_message_is_rejected(
        body in prop::collection::vec(any::<u8>(), MAX_BODY_LEN + 1..MAX_BODY_LEN + 64),
    ) {
        let message = ApplianceMessage::new(0xAC, 3, 0x02, body);
        prop_assert!(message.to_bytes().is_err());
    }
}

// Property: decoding never panics on arbitrary garbage.
proptest! {
    #[test]
    fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut state = keyed([0u8; 32]);
        state.feed(&data);
        let _ = state.decode_stream();

        let _ = packet::parse(&data);
        let _ = ApplianceMessage::parse(&data);
    }
}
