use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

/// Key size used when none is configured
pub const DEFAULT_KEY_BITS: usize = 512;

const PEM_PUBLIC_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_PUBLIC_FOOTER: &str = "-----END PUBLIC KEY-----";

/// Framing bytes in every PKCS#1 type-1 block: `00 01`, at least eight `FF`, `00`
const BLOCK_OVERHEAD: usize = 11;
const MIN_PADDING: usize = 8;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Failed to generate keypair: {0}")]
    KeypairGenerationError(String),

    #[error("Failed to sign message: {0}")]
    SigningError(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid authentication tag: {0}")]
    InvalidTag(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),

    #[error("Key file error: {0}")]
    KeyFileError(#[from] std::io::Error),
}

/// Represents an account address: the PEM public key with its armor and line breaks removed
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub struct Address(pub String);

impl Address {
    /// Creates a new address from a public key
    pub fn from_public_key(public_key: &RsaPublicKey) -> Result<Self, CryptoError> {
        let pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::EncodingError(e.to_string()))?;

        Ok(Self::from_pem(&pem))
    }

    /// Strips the PEM header, footer and line breaks from a public key
    pub fn from_pem(pem: &str) -> Self {
        let body = pem
            .replace(PEM_PUBLIC_HEADER, "")
            .replace(PEM_PUBLIC_FOOTER, "")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        Address(body)
    }

    /// Converts the address back to a public key
    pub fn to_public_key(&self) -> Result<RsaPublicKey, CryptoError> {
        let der = BASE64
            .decode(self.0.as_bytes())
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// A short prefix of the address for log lines
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(16).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.trim().to_string());

        // The address must resolve to a usable public key
        address.to_public_key()?;

        Ok(address)
    }
}

/// Authentication tag produced by a [`Signer`], base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AuthTag(pub String);

impl AuthTag {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        AuthTag(BASE64.encode(bytes))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        BASE64
            .decode(self.0.as_bytes())
            .map_err(|e| CryptoError::DecodingError(e.to_string()))
    }
}

/// Produces authentication tags over arbitrary payloads
pub trait Signer {
    /// Address the produced tags verify against
    fn address(&self) -> &Address;

    fn sign(&self, payload: &[u8]) -> Result<AuthTag, CryptoError>;
}

/// Checks authentication tags against a claimed address
pub trait Verifier {
    /// Recovers the payload a tag was produced over
    fn recover(&self, address: &Address, tag: &AuthTag) -> Result<Vec<u8>, CryptoError>;

    /// Returns true only if the tag recovers exactly `expected`.
    /// Malformed tags and addresses are reported as `false`.
    fn verify(&self, address: &Address, tag: &AuthTag, expected: &[u8]) -> bool {
        match self.recover(address, tag) {
            Ok(recovered) => recovered == expected,
            Err(err) => {
                debug!("Tag verification failed for {}: {}", address.short(), err);
                false
            }
        }
    }
}

/// Verifier for tags made with the raw RSA private-key transform.
///
/// Each block of the tag is raised to the public exponent and must unwrap to a
/// PKCS#1 type-1 frame. There is no digest and no randomness, so the scheme is
/// deterministic and malleable; it should be replaced by a proper signature
/// scheme before holding real value.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRsa;

impl Verifier for RawRsa {
    fn recover(&self, address: &Address, tag: &AuthTag) -> Result<Vec<u8>, CryptoError> {
        let public_key = address.to_public_key()?;
        let block_len = public_key.size();
        let raw = tag.to_bytes()?;

        if raw.is_empty() || raw.len() % block_len != 0 {
            return Err(CryptoError::InvalidTag(format!(
                "length {} is not a multiple of the {} byte block size",
                raw.len(),
                block_len
            )));
        }

        let mut payload = Vec::with_capacity(raw.len());
        for chunk in raw.chunks(block_len) {
            let c = BigUint::from_bytes_be(chunk);
            if &c >= public_key.n() {
                return Err(CryptoError::InvalidTag("block exceeds modulus".to_string()));
            }

            let m = c.modpow(public_key.e(), public_key.n());
            let block = left_pad(&m.to_bytes_be(), block_len)
                .ok_or_else(|| CryptoError::InvalidTag("block exceeds modulus".to_string()))?;
            let data = unframe(&block)
                .ok_or_else(|| CryptoError::InvalidTag("bad block framing".to_string()))?;

            payload.extend_from_slice(data);
        }

        Ok(payload)
    }
}

/// Represents an identity with an RSA keypair
#[derive(Clone)]
pub struct Wallet {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    address: Address,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Creates a new wallet with a random keypair of the given size
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| CryptoError::KeypairGenerationError(e.to_string()))?;

        Self::from_private_key(private_key)
    }

    /// Creates a wallet from an existing private key
    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public_key = RsaPublicKey::from(&private_key);
        if public_key.size() <= BLOCK_OVERHEAD {
            return Err(CryptoError::InvalidPrivateKey(format!(
                "modulus of {} bytes is too small",
                public_key.size()
            )));
        }

        let address = Address::from_public_key(&public_key)?;

        Ok(Wallet {
            private_key,
            public_key,
            address,
        })
    }

    /// Creates a wallet from a PKCS#8 PEM private key
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        Self::from_private_key(private_key)
    }

    /// Reads the private key at `path`, or generates and saves a new one if the file is missing.
    ///
    /// A stored key whose size differs from `bits` is rejected.
    pub fn load_or_generate<P: AsRef<Path>>(path: P, bits: usize) -> Result<Self, CryptoError> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(pem) => {
                info!("Reading private key from {}", path.display());
                let wallet = Self::from_pem(&pem)?;

                if wallet.key_bits() != bits {
                    return Err(CryptoError::InvalidPrivateKey(format!(
                        "key in {} is {} bits, expected {}",
                        path.display(),
                        wallet.key_bits(),
                        bits
                    )));
                }

                Ok(wallet)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("Generating new {}-bit private key", bits);
                let wallet = Self::generate(bits)?;
                wallet.save(path)?;
                Ok(wallet)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the private key to `path` and the public key to `public.pem` beside it
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CryptoError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let private_pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::EncodingError(e.to_string()))?;
        fs::write(path, private_pem.as_bytes())?;

        let public_pem = self
            .public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::EncodingError(e.to_string()))?;
        fs::write(path.with_file_name("public.pem"), public_pem)?;

        info!("Saved keypair to {}", path.display());
        Ok(())
    }

    /// Gets the wallet's address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Size of the modulus in bits
    pub fn key_bits(&self) -> usize {
        self.public_key.n().bits()
    }
}

impl Signer for Wallet {
    fn address(&self) -> &Address {
        &self.address
    }

    /// Applies the private-key transform to the payload, one framed block at a time.
    ///
    /// Each chunk goes through unprefixed PKCS#1 v1.5 signing, which frames it
    /// as `00 01 FF .. FF 00 data` and runs the blinded private-key operation.
    fn sign(&self, payload: &[u8]) -> Result<AuthTag, CryptoError> {
        let block_len = self.public_key.size();
        let chunk_len = block_len - BLOCK_OVERHEAD;

        // An empty payload still yields one block
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(chunk_len).collect()
        };

        let mut rng = OsRng;
        let mut tag = Vec::with_capacity(chunks.len() * block_len);
        for chunk in chunks {
            let block = self
                .private_key
                .sign_with_rng(&mut rng, Pkcs1v15Sign::new_unprefixed(), chunk)
                .map_err(|e| CryptoError::SigningError(e.to_string()))?;

            tag.extend_from_slice(&block);
        }

        Ok(AuthTag::from_bytes(&tag))
    }
}

fn unframe(block: &[u8]) -> Option<&[u8]> {
    if block.len() < BLOCK_OVERHEAD || block[0] != 0x00 || block[1] != 0x01 {
        return None;
    }

    let separator = block[2..].iter().position(|&b| b != 0xFF)? + 2;
    if block[separator] != 0x00 || separator - 2 < MIN_PADDING {
        return None;
    }

    Some(&block[separator + 1..])
}

fn left_pad(bytes: &[u8], len: usize) -> Option<Vec<u8>> {
    if bytes.len() > len {
        return None;
    }

    let mut padded = vec![0u8; len - bytes.len()];
    padded.extend_from_slice(bytes);
    Some(padded)
}
