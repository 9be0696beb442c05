//! Threshold ElGamal over Ristretto.
//!
//! A secret is sealed once to the vault DON's group key. Each vault node
//! holds a Shamir share `x_i` of the group secret and answers a fetch with a
//! decryption share `x_i * U` plus a DLEQ proof that it used the same `x_i`
//! behind its published verification key. Any `t` valid shares reconstruct
//! `x * U` by Lagrange interpolation in the exponent, which keys the AEAD
//! that protects the plaintext.
//!
//! Ciphertexts carry a Schnorr proof of knowledge of `r`, so a node never
//! produces shares for a ciphertext nobody could have built honestly.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

use crate::error::{SecretsError, SecretsResult};

const HKDF_INFO: &[u8] = b"donflow-threshold-v1";
const NONCE_LEN: usize = 24;

/// Public half of a threshold key: the group key and one verification key
/// per share index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    group_key: RistrettoPoint,
    verification_keys: Vec<RistrettoPoint>,
}

/// One node's share of the group secret. Indices start at 1.
pub struct PrivateShare {
    index: u32,
    scalar: Scalar,
}

/// A sealed secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    u: RistrettoPoint,
    nonce: [u8; NONCE_LEN],
    body: Vec<u8>,
    challenge: Scalar,
    response: Scalar,
}

/// One node's contribution to decrypting a [`Ciphertext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionShare {
    index: u32,
    d: RistrettoPoint,
    challenge: Scalar,
    response: Scalar,
}

/// Split a fresh group secret into `n` shares, any `t` of which decrypt.
pub fn generate_keys(
    t: usize,
    n: usize,
    rng: &mut impl CryptoRngCore,
) -> SecretsResult<(PublicKey, Vec<PrivateShare>)> {
    if t == 0 || t > n {
        return Err(SecretsError::Config(format!(
            "invalid threshold {t} for {n} shares"
        )));
    }
    let index_limit = u32::try_from(n)
        .map_err(|_| SecretsError::Config(format!("too many shares: {n}")))?;

    let coefficients: Vec<Scalar> = (0..t).map(|_| Scalar::random(rng)).collect();
    let group_key = RISTRETTO_BASEPOINT_POINT * coefficients[0];

    let mut shares = Vec::with_capacity(n);
    let mut verification_keys = Vec::with_capacity(n);
    for index in 1..=index_limit {
        let x = Scalar::from(u64::from(index));
        // Horner evaluation of the sharing polynomial at x.
        let scalar = coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient);
        verification_keys.push(RISTRETTO_BASEPOINT_POINT * scalar);
        shares.push(PrivateShare { index, scalar });
    }

    Ok((
        PublicKey {
            group_key,
            verification_keys,
        },
        shares,
    ))
}

impl PublicKey {
    /// Number of shares the key was split into.
    #[must_use]
    pub fn share_count(&self) -> usize {
        self.verification_keys.len()
    }

    fn verification_key(&self, index: u32) -> Option<&RistrettoPoint> {
        let slot = usize::try_from(index).ok()?.checked_sub(1)?;
        self.verification_keys.get(slot)
    }

    /// Seal `plaintext` to the group.
    pub fn encrypt(&self, plaintext: &[u8], rng: &mut impl CryptoRngCore) -> SecretsResult<Ciphertext> {
        let r = Scalar::random(rng);
        let u = RISTRETTO_BASEPOINT_POINT * r;
        let shared = self.group_key * r;

        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let body = seal(&shared, &u, &nonce, plaintext)?;

        let w = Scalar::random(rng);
        let commitment = RISTRETTO_BASEPOINT_POINT * w;
        let challenge = ciphertext_challenge(&self.group_key, &u, &commitment, &nonce, &body);
        Ok(Ciphertext {
            u,
            nonce,
            body,
            challenge,
            response: w + challenge * r,
        })
    }

    /// Check a ciphertext's proof against this key.
    pub fn verify_ciphertext(&self, ciphertext: &Ciphertext) -> SecretsResult<()> {
        let commitment =
            RISTRETTO_BASEPOINT_POINT * ciphertext.response - ciphertext.u * ciphertext.challenge;
        let expected = ciphertext_challenge(
            &self.group_key,
            &ciphertext.u,
            &commitment,
            &ciphertext.nonce,
            &ciphertext.body,
        );
        if expected == ciphertext.challenge {
            Ok(())
        } else {
            Err(SecretsError::InvalidCiphertext)
        }
    }

    /// Check that `share` was produced for `ciphertext` by the holder of its index.
    pub fn verify_share(&self, ciphertext: &Ciphertext, share: &DecryptionShare) -> SecretsResult<()> {
        let invalid = |reason: &str| SecretsError::InvalidShare {
            index: share.index,
            reason: reason.to_owned(),
        };
        let verification_key = self
            .verification_key(share.index)
            .ok_or_else(|| invalid("index out of range"))?;

        let a = RISTRETTO_BASEPOINT_POINT * share.response - verification_key * share.challenge;
        let b = ciphertext.u * share.response - share.d * share.challenge;
        let expected = share_challenge(verification_key, &ciphertext.u, &share.d, &a, &b, share.index);
        if expected == share.challenge {
            Ok(())
        } else {
            Err(invalid("proof does not verify"))
        }
    }

    /// Combine verified shares and open `ciphertext`.
    ///
    /// Shares are expected to be verified already; duplicates by index are
    /// ignored and only the first `threshold` distinct ones are used.
    pub fn aggregate(
        &self,
        ciphertext: &Ciphertext,
        shares: &[DecryptionShare],
        threshold: usize,
    ) -> SecretsResult<Vec<u8>> {
        let mut chosen: Vec<&DecryptionShare> = Vec::with_capacity(threshold);
        for share in shares {
            if chosen.len() == threshold {
                break;
            }
            if chosen.iter().all(|c| c.index != share.index) {
                chosen.push(share);
            }
        }
        if threshold == 0 || chosen.len() < threshold {
            return Err(SecretsError::NotEnoughShares {
                have: chosen.len(),
                need: threshold,
            });
        }

        let indices: Vec<u32> = chosen.iter().map(|s| s.index).collect();
        let mut shared = RistrettoPoint::default();
        for share in &chosen {
            shared += share.d * lagrange_at_zero(share.index, &indices);
        }
        open(&shared, &ciphertext.u, &ciphertext.nonce, &ciphertext.body)
    }

    /// JSON encoding with hex points.
    pub fn to_bytes(&self) -> SecretsResult<Vec<u8>> {
        let wire = PublicKeyWire {
            group_key: point_hex(&self.group_key),
            verification_keys: self.verification_keys.iter().map(point_hex).collect(),
        };
        serde_json::to_vec(&wire).map_err(SecretsError::encoding)
    }

    /// Parse [`PublicKey::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> SecretsResult<Self> {
        let wire: PublicKeyWire = serde_json::from_slice(bytes).map_err(SecretsError::encoding)?;
        Ok(Self {
            group_key: point_from_hex(&wire.group_key)?,
            verification_keys: wire
                .verification_keys
                .iter()
                .map(|key| point_from_hex(key))
                .collect::<SecretsResult<_>>()?,
        })
    }
}

impl PrivateShare {
    /// 1-based share index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Produce this share's decryption share for `ciphertext`, with proof.
    pub fn decryption_share(
        &self,
        public_key: &PublicKey,
        ciphertext: &Ciphertext,
        rng: &mut impl CryptoRngCore,
    ) -> SecretsResult<DecryptionShare> {
        public_key.verify_ciphertext(ciphertext)?;
        let verification_key = RISTRETTO_BASEPOINT_POINT * self.scalar;
        let d = ciphertext.u * self.scalar;

        let w = Scalar::random(rng);
        let a = RISTRETTO_BASEPOINT_POINT * w;
        let b = ciphertext.u * w;
        let challenge = share_challenge(&verification_key, &ciphertext.u, &d, &a, &b, self.index);
        Ok(DecryptionShare {
            index: self.index,
            d,
            challenge,
            response: w + challenge * self.scalar,
        })
    }
}

impl std::fmt::Debug for PrivateShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateShare")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Drop for PrivateShare {
    fn drop(&mut self) {
        self.scalar.zeroize();
    }
}

impl Ciphertext {
    /// JSON encoding with hex fields.
    pub fn to_bytes(&self) -> SecretsResult<Vec<u8>> {
        let wire = CiphertextWire {
            u: point_hex(&self.u),
            nonce: hex::encode(self.nonce),
            body: hex::encode(&self.body),
            challenge: hex::encode(self.challenge.as_bytes()),
            response: hex::encode(self.response.as_bytes()),
        };
        serde_json::to_vec(&wire).map_err(SecretsError::encoding)
    }

    /// Parse [`Ciphertext::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> SecretsResult<Self> {
        let wire: CiphertextWire = serde_json::from_slice(bytes).map_err(SecretsError::encoding)?;
        let nonce = hex::decode(&wire.nonce).map_err(SecretsError::encoding)?;
        Ok(Self {
            u: point_from_hex(&wire.u)?,
            nonce: nonce
                .try_into()
                .map_err(|_| SecretsError::encoding("nonce must be 24 bytes"))?,
            body: hex::decode(&wire.body).map_err(SecretsError::encoding)?,
            challenge: scalar_from_hex(&wire.challenge)?,
            response: scalar_from_hex(&wire.response)?,
        })
    }
}

impl DecryptionShare {
    /// 1-based index of the share that produced this.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// JSON encoding with hex fields.
    pub fn to_bytes(&self) -> SecretsResult<Vec<u8>> {
        let wire = DecryptionShareWire {
            index: self.index,
            d: point_hex(&self.d),
            challenge: hex::encode(self.challenge.as_bytes()),
            response: hex::encode(self.response.as_bytes()),
        };
        serde_json::to_vec(&wire).map_err(SecretsError::encoding)
    }

    /// Parse [`DecryptionShare::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> SecretsResult<Self> {
        let wire: DecryptionShareWire =
            serde_json::from_slice(bytes).map_err(SecretsError::encoding)?;
        Ok(Self {
            index: wire.index,
            d: point_from_hex(&wire.d)?,
            challenge: scalar_from_hex(&wire.challenge)?,
            response: scalar_from_hex(&wire.response)?,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct PublicKeyWire {
    group_key: String,
    verification_keys: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct CiphertextWire {
    u: String,
    nonce: String,
    body: String,
    challenge: String,
    response: String,
}

#[derive(Serialize, Deserialize)]
struct DecryptionShareWire {
    index: u32,
    d: String,
    challenge: String,
    response: String,
}

fn point_hex(point: &RistrettoPoint) -> String {
    hex::encode(point.compress().as_bytes())
}

fn point_from_hex(value: &str) -> SecretsResult<RistrettoPoint> {
    let bytes = hex::decode(value).map_err(SecretsError::encoding)?;
    CompressedRistretto::from_slice(&bytes)
        .map_err(SecretsError::encoding)?
        .decompress()
        .ok_or_else(|| SecretsError::encoding("not a valid ristretto point"))
}

fn scalar_from_hex(value: &str) -> SecretsResult<Scalar> {
    let bytes: [u8; 32] = hex::decode(value)
        .map_err(SecretsError::encoding)?
        .try_into()
        .map_err(|_| SecretsError::encoding("scalar must be 32 bytes"))?;
    Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes))
        .ok_or_else(|| SecretsError::encoding("scalar is not canonical"))
}

fn hash_to_scalar(label: &str, points: &[&RistrettoPoint], extra: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(HKDF_INFO);
    hasher.update(label.as_bytes());
    for point in points {
        hasher.update(point.compress().as_bytes());
    }
    for bytes in extra {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn ciphertext_challenge(
    group_key: &RistrettoPoint,
    u: &RistrettoPoint,
    commitment: &RistrettoPoint,
    nonce: &[u8],
    body: &[u8],
) -> Scalar {
    hash_to_scalar("ct", &[group_key, u, commitment], &[nonce, body])
}

fn share_challenge(
    verification_key: &RistrettoPoint,
    u: &RistrettoPoint,
    d: &RistrettoPoint,
    a: &RistrettoPoint,
    b: &RistrettoPoint,
    index: u32,
) -> Scalar {
    hash_to_scalar("share", &[verification_key, u, d, a, b], &[index.to_le_bytes().as_slice()])
}

/// Lagrange coefficient of `index` for interpolating at zero over `indices`.
fn lagrange_at_zero(index: u32, indices: &[u32]) -> Scalar {
    let i = Scalar::from(u64::from(index));
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for &other in indices.iter().filter(|&&other| other != index) {
        let j = Scalar::from(u64::from(other));
        numerator *= j;
        denominator *= j - i;
    }
    numerator * denominator.invert()
}

fn derive_key(shared: &RistrettoPoint, u: &RistrettoPoint) -> SecretsResult<[u8; 32]> {
    let ikm = shared.compress();
    let hk = Hkdf::<Sha256>::new(None, ikm.as_bytes());
    let mut info = Vec::with_capacity(HKDF_INFO.len() + 32);
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(u.compress().as_bytes());
    let mut key = [0u8; 32];
    hk.expand(&info, &mut key)
        .map_err(|e| SecretsError::Decryption(format!("hkdf expand: {e}")))?;
    Ok(key)
}

fn seal(
    shared: &RistrettoPoint,
    u: &RistrettoPoint,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> SecretsResult<Vec<u8>> {
    let mut key = derive_key(shared, u)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    let aad = u.compress();
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| SecretsError::Decryption(e.to_string()))
}

fn open(
    shared: &RistrettoPoint,
    u: &RistrettoPoint,
    nonce: &[u8; NONCE_LEN],
    body: &[u8],
) -> SecretsResult<Vec<u8>> {
    let mut key = derive_key(shared, u)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    let aad = u.compress();
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: body,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| SecretsError::Decryption(e.to_string()))
}
