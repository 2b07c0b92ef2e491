use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TOKEN_KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;
const ENVELOPE_PREFIX: &str = "sealed:";

#[derive(Debug, Error)]
pub enum SealError {
    #[error("token key must be 64 hex characters (32 bytes)")]
    InvalidKey,

    #[error("malformed sealed token: {0}")]
    Malformed(String),

    #[error("unsupported sealed token version {0}")]
    UnsupportedVersion(u8),

    #[error("token sealing failed")]
    Crypto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

/// Seals OAuth tokens before they are written to the users table.
#[derive(Clone)]
pub struct TokenSealer {
    key: [u8; TOKEN_KEY_BYTES],
}

impl std::fmt::Debug for TokenSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSealer").finish_non_exhaustive()
    }
}

impl TokenSealer {
    pub fn new(key: [u8; TOKEN_KEY_BYTES]) -> Self {
        Self { key }
    }

    pub fn from_hex(raw: &str) -> Result<Self, SealError> {
        let decoded = hex_decode(raw).map_err(|_| SealError::InvalidKey)?;
        let key: [u8; TOKEN_KEY_BYTES] = decoded.try_into().map_err(|_| SealError::InvalidKey)?;
        Ok(Self::new(key))
    }

    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SealError> {
        let mut buffer = plaintext.as_bytes().to_vec();

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| SealError::Crypto)?;

        self.key()?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| SealError::Crypto)?;

        let envelope = SealedEnvelope {
            version: ENVELOPE_VERSION,
            nonce_hex: hex_encode(&nonce_bytes),
            ciphertext_hex: hex_encode(&buffer),
        };
        let json = serde_json::to_string(&envelope)
            .map_err(|error| SealError::Malformed(error.to_string()))?;
        Ok(format!("{ENVELOPE_PREFIX}{json}"))
    }

    /// Opens a sealed value. Values stored before a key was configured pass
    /// through unchanged.
    pub fn open(&self, stored: &str) -> Result<String, SealError> {
        let Some(json) = stored.strip_prefix(ENVELOPE_PREFIX) else {
            return Ok(stored.to_string());
        };

        let envelope: SealedEnvelope =
            serde_json::from_str(json).map_err(|error| SealError::Malformed(error.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(SealError::UnsupportedVersion(envelope.version));
        }

        let nonce_vec = hex_decode(&envelope.nonce_hex)?;
        let nonce_bytes: [u8; NONCE_BYTES] = nonce_vec
            .try_into()
            .map_err(|_| SealError::Malformed("nonce length".to_string()))?;
        let mut ciphertext = hex_decode(&envelope.ciphertext_hex)?;

        let plaintext = self
            .key()?
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut ciphertext,
            )
            .map_err(|_| SealError::Crypto)?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|error| SealError::Malformed(error.to_string()))
    }

    fn key(&self) -> Result<LessSafeKey, SealError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| SealError::Crypto)?;
        Ok(LessSafeKey::new(unbound))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>, SealError> {
    let value = raw.trim().as_bytes();
    if value.len() % 2 != 0 {
        return Err(SealError::Malformed("odd hex length".to_string()));
    }

    value
        .chunks(2)
        .map(|pair| {
            let hi = decode_hex_nibble(pair[0]);
            let lo = decode_hex_nibble(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
                _ => Err(SealError::Malformed("invalid hex digit".to_string())),
            }
        })
        .collect()
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
