use crate::errors::SignerError;
use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use p256::{
    ecdh::diffie_hellman,
    pkcs8::{DecodePrivateKey as _, DecodePublicKey as _, EncodePrivateKey as _, EncodePublicKey as _},
    PublicKey, SecretKey,
};
use rand::Rng as _;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

const IV_LEN: usize = 12;

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

/// P-256 key pair used for one session.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_hex().unwrap_or_default())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Result<Self, SignerError> {
        // Out-of-range scalars are astronomically rare; bound the loop anyway.
        for _ in 0_u8..8_u8 {
            let mut bytes = Zeroizing::new([0_u8; 32]);
            fill_random(bytes.as_mut());
            if let Ok(secret) = SecretKey::from_slice(bytes.as_ref()) {
                let public = secret.public_key();
                return Ok(Self { secret, public });
            }
        }
        Err(SignerError::internal("failed to generate session key"))
    }

    pub fn from_pkcs8_hex(s: &str) -> Result<Self, SignerError> {
        let der = Zeroizing::new(
            hex::decode(s.trim_start_matches("0x"))
                .map_err(|e| SignerError::internal(format!("decode private key hex: {e}")))?,
        );
        let secret = SecretKey::from_pkcs8_der(&der)
            .map_err(|e| SignerError::internal(format!("import private key: {e}")))?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    pub fn to_pkcs8_hex(&self) -> Result<Zeroizing<String>, SignerError> {
        let doc = self
            .secret
            .to_pkcs8_der()
            .map_err(|e| SignerError::internal(format!("export private key: {e}")))?;
        Ok(Zeroizing::new(hex::encode(doc.as_bytes())))
    }

    /// SPKI DER encoding of the public key, hex encoded. This is the `sender` of every
    /// envelope.
    pub fn public_key_hex(&self) -> Result<String, SignerError> {
        let doc = self
            .public
            .to_public_key_der()
            .map_err(|e| SignerError::internal(format!("export public key: {e}")))?;
        Ok(hex::encode(doc.as_bytes()))
    }
}

/// The wallet's public key as received in a handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerKey(PublicKey);

impl PeerKey {
    pub fn to_hex(&self) -> Result<String, SignerError> {
        let doc = self
            .0
            .to_public_key_der()
            .map_err(|e| SignerError::internal(format!("export peer key: {e}")))?;
        Ok(hex::encode(doc.as_bytes()))
    }
}

/// Import a peer key from SPKI DER (preferred) or SEC1 point bytes.
pub fn import_peer_public_key(bytes: &[u8]) -> Result<PeerKey, SignerError> {
    PublicKey::from_public_key_der(bytes)
        .or_else(|_| PublicKey::from_sec1_bytes(bytes))
        .map(PeerKey)
        .map_err(|e| SignerError::InvalidParams(format!("invalid peer public key: {e}")))
}

pub fn import_peer_public_key_hex(s: &str) -> Result<PeerKey, SignerError> {
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| SignerError::InvalidParams(format!("invalid peer public key hex: {e}")))?;
    import_peer_public_key(&bytes)
}

/// AES-256 key derived from ECDH. Wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

pub fn derive_shared_secret(
    own: &KeyPair,
    peer: Option<&PeerKey>,
) -> Result<SharedSecret, SignerError> {
    let peer = peer.ok_or(SignerError::NoSharedSecret)?;
    let shared = diffie_hellman(own.secret.to_nonzero_scalar(), peer.0.as_affine());
    let mut key = Zeroizing::new([0_u8; 32]);
    key.copy_from_slice(shared.raw_secret_bytes());
    Ok(SharedSecret(key))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedData {
    pub iv: String,
    pub cipher_text: String,
}

pub fn encrypt(secret: &SharedSecret, plaintext: &[u8]) -> Result<EncryptedData, SignerError> {
    let cipher = Aes256Gcm::new_from_slice(secret.0.as_ref())
        .map_err(|e| SignerError::internal(format!("aes init: {e}")))?;
    let mut iv = [0_u8; IV_LEN];
    fill_random(&mut iv);
    let ct = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| SignerError::internal(format!("aes encrypt: {e}")))?;

    Ok(EncryptedData {
        iv: base64::engine::general_purpose::STANDARD.encode(iv),
        cipher_text: base64::engine::general_purpose::STANDARD.encode(ct),
    })
}

pub fn decrypt(secret: &SharedSecret, data: &EncryptedData) -> Result<Vec<u8>, SignerError> {
    let cipher = Aes256Gcm::new_from_slice(secret.0.as_ref())
        .map_err(|e| SignerError::internal(format!("aes init: {e}")))?;
    let iv = base64::engine::general_purpose::STANDARD
        .decode(&data.iv)
        .map_err(|e| SignerError::DecryptionFailed(format!("decode iv: {e}")))?;
    if iv.len() != IV_LEN {
        return Err(SignerError::DecryptionFailed("invalid iv length".into()));
    }
    let ct = base64::engine::general_purpose::STANDARD
        .decode(&data.cipher_text)
        .map_err(|e| SignerError::DecryptionFailed(format!("decode ciphertext: {e}")))?;

    cipher
        .decrypt(Nonce::from_slice(&iv), ct.as_ref())
        .map_err(|e| SignerError::DecryptionFailed(format!("aes decrypt: {e}")))
}

pub fn encrypt_content<T: Serialize>(
    content: &T,
    secret: &SharedSecret,
) -> Result<EncryptedData, SignerError> {
    let plaintext = Zeroizing::new(serde_json::to_vec(content)?);
    encrypt(secret, &plaintext)
}

pub fn decrypt_content<T: DeserializeOwned>(
    data: &EncryptedData,
    secret: &SharedSecret,
) -> Result<T, SignerError> {
    let plaintext = Zeroizing::new(decrypt(secret, data)?);
    serde_json::from_slice(&plaintext)
        .map_err(|e| SignerError::DecryptionFailed(format!("decrypted content is not valid: {e}")))
}
