//! The node's workflow encryption key.
//!
//! Vault nodes seal each decryption share to the X25519 key of the node that
//! asked for it. A sealed box is `ephemeral_pub (32) || nonce (24) || ciphertext`,
//! keyed by HKDF-SHA256 over the ECDH secret and bound to both public keys.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{SecretsError, SecretsResult};

const HKDF_INFO: &[u8] = b"donflow-workflow-key-v1";
const PUBLIC_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// X25519 key pair used to receive sealed decryption shares.
pub struct WorkflowKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl WorkflowKey {
    /// Fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Key from its 32 secret bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Public half, hex encoded, as vault requests name it.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Seal `plaintext` to `recipient`.
    pub fn seal(recipient: &[u8; 32], plaintext: &[u8]) -> SecretsResult<Vec<u8>> {
        let recipient = PublicKey::from(*recipient);
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let cipher = cipher_for(&ephemeral.diffie_hellman(&recipient).to_bytes(), &ephemeral_public)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = binding(&ephemeral_public, &recipient);
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|e| SecretsError::Decryption(e.to_string()))?;

        let mut out = Vec::with_capacity(PUBLIC_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a box sealed to this key.
    pub fn open(&self, sealed: &[u8]) -> SecretsResult<Vec<u8>> {
        if sealed.len() < PUBLIC_LEN + NONCE_LEN + TAG_LEN {
            return Err(SecretsError::Decryption("sealed box too short".into()));
        }
        let (ephemeral_bytes, rest) = sealed.split_at(PUBLIC_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let ephemeral_bytes: [u8; PUBLIC_LEN] = ephemeral_bytes
            .try_into()
            .map_err(|_| SecretsError::Decryption("malformed ephemeral key".into()))?;
        let ephemeral_public = PublicKey::from(ephemeral_bytes);

        let cipher = cipher_for(&self.secret.diffie_hellman(&ephemeral_public).to_bytes(), &ephemeral_public)?;
        let aad = binding(&ephemeral_public, &self.public);
        cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
            .map_err(|e| SecretsError::Decryption(e.to_string()))
    }
}

impl std::fmt::Debug for WorkflowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowKey")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

fn binding(ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; 64] {
    let mut aad = [0u8; 64];
    aad[..PUBLIC_LEN].copy_from_slice(ephemeral.as_bytes());
    aad[PUBLIC_LEN..].copy_from_slice(recipient.as_bytes());
    aad
}

fn cipher_for(shared: &[u8; 32], ephemeral: &PublicKey) -> SecretsResult<XChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(Some(ephemeral.as_bytes()), shared);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| SecretsError::Decryption(format!("hkdf expand: {e}")))?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    Ok(cipher)
}
