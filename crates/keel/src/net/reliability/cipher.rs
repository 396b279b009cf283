use bytes::BufMut;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use super::frame::{LinkError, SEALED_TAG};
use crate::net::security::SessionKey;

const COUNTER_LEN: usize = 8;
const HEADER_LEN: usize = 1 + COUNTER_LEN;
const TAG_LEN: usize = 16;
const BLOCK: usize = 16;

/// Seals datagram bodies as `[tag][counter][ciphertext]`, padded so the whole
/// datagram length is a multiple of 16.
pub struct DatagramCipher {
    cipher: ChaCha20Poly1305,
    outbound_direction: u8,
    inbound_direction: u8,
    counter: u64,
}

impl DatagramCipher {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
            outbound_direction: key.outbound_direction(),
            inbound_direction: key.inbound_direction(),
            counter: 0,
        }
    }

    pub fn seal(&mut self, body: &[u8]) -> Result<Vec<u8>, LinkError> {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);

        let unpadded = HEADER_LEN + body.len() + 1 + TAG_LEN;
        let pad = (BLOCK - unpadded % BLOCK) % BLOCK;

        let mut plaintext = Vec::with_capacity(body.len() + pad + 1);
        plaintext.extend_from_slice(body);
        plaintext.resize(body.len() + pad, 0);
        plaintext.put_u8(pad as u8);

        let mut header = [0u8; HEADER_LEN];
        header[0] = SEALED_TAG;
        header[1..].copy_from_slice(&counter.to_be_bytes());

        let ciphertext = self
            .cipher
            .encrypt(
                &nonce(self.outbound_direction, counter),
                Payload {
                    msg: &plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| LinkError::Authentication)?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Returns the datagram body with padding removed.
    pub fn open(&self, datagram: &[u8]) -> Result<Vec<u8>, LinkError> {
        if datagram.len() < HEADER_LEN + 1 + TAG_LEN || datagram.len() % BLOCK != 0 {
            return Err(LinkError::Truncated);
        }
        if datagram[0] != SEALED_TAG {
            return Err(LinkError::BadTag(datagram[0]));
        }

        let (header, ciphertext) = datagram.split_at(HEADER_LEN);
        let mut counter = [0u8; COUNTER_LEN];
        counter.copy_from_slice(&header[1..]);

        let mut plaintext = self
            .cipher
            .decrypt(
                &nonce(self.inbound_direction, u64::from_be_bytes(counter)),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| LinkError::Authentication)?;

        let pad = plaintext.pop().ok_or(LinkError::Truncated)? as usize;
        if pad >= BLOCK || pad > plaintext.len() {
            return Err(LinkError::Truncated);
        }
        plaintext.truncate(plaintext.len() - pad);
        Ok(plaintext)
    }
}

impl std::fmt::Debug for DatagramCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramCipher")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

fn nonce(direction: u8, counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[0] = direction;
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::clone_from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (DatagramCipher, DatagramCipher) {
        let bytes = [7u8; 32];
        (
            DatagramCipher::new(&SessionKey::new(bytes, true)),
            DatagramCipher::new(&SessionKey::new(bytes, false)),
        )
    }

    #[test]
    fn sealed_lengths_are_block_multiples() {
        let (mut client, server) = pair();
        for len in 0..40 {
            let body = vec![len as u8; len];
            let sealed = client.seal(&body).unwrap();
            assert_eq!(sealed.len() % 16, 0);
            assert_eq!(server.open(&sealed).unwrap(), body);
        }
    }

    #[test]
    fn direction_separates_halves() {
        let (mut client, _) = pair();
        let sealed = client.seal(b"ping").unwrap();
        // a reflected datagram must not open on the sender
        assert_eq!(client.open(&sealed), Err(LinkError::Authentication));
    }

    #[test]
    fn tampering_detected() {
        let (mut client, server) = pair();
        let mut sealed = client.seal(b"payload").unwrap();
        sealed[3] ^= 1;
        assert_eq!(server.open(&sealed), Err(LinkError::Authentication));
    }
}
