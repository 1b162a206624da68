//! Session-key handshake for protocol v3.
//!
//! The client sends its 64-byte pairing token in a plaintext handshake frame.
//! The device answers with 64 bytes: a 32-byte AES-256-CBC sealed secret and
//! a 32-byte SHA-256 of the secret's plaintext. The session key is the
//! decrypted secret XORed with the pairing key; both sequence counters
//! restart at zero once it is installed.
//!
//! Protocol v2 devices skip all of this; inner envelopes go straight onto
//! the socket.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};
use zeroize::Zeroize;

use crate::core::codec::{Frame, FrameType, TransportState};
use crate::core::crypto;
use crate::error::{constants, LanError, Result};
use crate::utils::timeout::{with_timeout_error, RESPONSE_TIMEOUT};

/// Derive the session key from a 64-byte handshake response.
///
/// # Errors
/// `LanError::Auth` when the response is not 64 bytes or its signature does
/// not match the decrypted secret.
pub fn derive_tcp_key(response: &[u8], key: &[u8; 32]) -> Result<[u8; 32]> {
    if response.len() != 64 {
        return Err(LanError::Auth(constants::ERR_HANDSHAKE_SHORT.into()));
    }

    let (payload, sign) = response.split_at(32);
    let mut plain = crypto::decrypt_cbc(payload, key)?;
    if crypto::sha256(&plain) != sign {
        plain.zeroize();
        return Err(LanError::Auth(constants::ERR_HANDSHAKE_SIGN.into()));
    }

    let mut xored = crypto::buffer_xor(&plain, key);
    plain.zeroize();

    let mut tcp_key = [0u8; 32];
    tcp_key.copy_from_slice(&xored);
    xored.zeroize();
    Ok(tcp_key)
}

/// Run the handshake on a fresh connection and install the session key.
///
/// # Errors
/// `LanError::Auth` for a missing, short, or unverifiable response; I/O
/// errors propagate as-is.
#[instrument(skip_all)]
pub async fn authenticate(
    stream: &mut TcpStream,
    state: &mut TransportState,
    token: &[u8; 64],
    key: &[u8; 32],
) -> Result<()> {
    let request = state.encode_frame(token, FrameType::HandshakeRequest)?;
    stream.write_all(&request).await?;

    // A silent device is a connectivity problem and worth retrying; only a
    // device that answers wrong is an authentication failure.
    let response = with_timeout_error(read_handshake_response(stream, state), RESPONSE_TIMEOUT)
        .await
        .map_err(|e| match e {
            LanError::Timeout => LanError::Connect(constants::ERR_HANDSHAKE_NO_REPLY.into()),
            other => other,
        })?;

    let tcp_key = derive_tcp_key(&response, key)?;
    state.set_tcp_key(tcp_key);
    debug!("handshake complete");
    Ok(())
}

async fn read_handshake_response(
    stream: &mut TcpStream,
    state: &mut TransportState,
) -> Result<Vec<u8>> {
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(LanError::ConnectionClosed);
        }
        state.feed(&buf[..n]);
        if let Some(frame) = state.decode_stream()?.into_iter().next() {
            return match frame {
                Frame::Message(body) => Ok(body),
                Frame::Error => Err(LanError::DeviceError),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build the 64-byte response a device would send for `secret`.
    fn server_response(secret: &[u8; 32], key: &[u8; 32]) -> Vec<u8> {
        let mut response = crypto::encrypt_cbc(secret, key).unwrap();
        response.extend_from_slice(&crypto::sha256(secret));
        response
    }

    #[test]
    fn derives_secret_xor_key() {
        let key = [0x42u8; 32];
        let secret = {
            let mut s = [0u8; 32];
            for (i, b) in s.iter_mut().enumerate() {
                *b = i as u8;
            }
            s
        };

        let tcp_key = derive_tcp_key(&server_response(&secret, &key), &key).unwrap();
        for (i, b) in tcp_key.iter().enumerate() {
            assert_eq!(*b, secret[i] ^ key[i]);
        }
    }

    #[test]
    fn rejects_short_response() {
        let key = [0u8; 32];
        assert!(matches!(
            derive_tcp_key(&[0u8; 63], &key),
            Err(LanError::Auth(_))
        ));
    }

    #[test]
    fn rejects_signature_mismatch() {
        let key = [0x42u8; 32];
        let mut response = server_response(&[0x07u8; 32], &key);
        response[40] ^= 0x01;
        assert!(matches!(
            derive_tcp_key(&response, &key),
            Err(LanError::Auth(_))
        ));
    }

    #[test]
    fn rejects_wrong_key() {
        let key = [0x42u8; 32];
        let other = [0x43u8; 32];
        let response = server_response(&[0x07u8; 32], &key);
        // Decrypting under the wrong key yields a different plaintext, so
        // the signature check fails.
        assert!(matches!(
            derive_tcp_key(&response, &other),
            Err(LanError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn authenticate_against_mock_device() {
        let key = [0x11u8; 32];
        let secret = [0x2Au8; 32];
        let token = [0x5Au8; 64];

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let response = server_response(&secret, &key);
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 72];
            sock.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[8..], &[0x5Au8; 64][..]);

            let mut state = TransportState::new();
            let frame = state
                .encode_frame(&response, FrameType::HandshakeResponse)
                .unwrap();
            sock.write_all(&frame).await.unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut state = TransportState::new();
        authenticate(&mut stream, &mut state, &token, &key)
            .await
            .unwrap();

        assert!(state.has_tcp_key());
        assert_eq!(state.request_counter(), 0, "counters reset after handshake");
        server.await.unwrap();
    }
}
