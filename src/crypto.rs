/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Primitives for PIN protocol 1: P-256 key agreement, AES-256-CBC with a
//! zero IV, and HMAC-SHA-256 truncated to 16 bytes for pinAuth values.

use aes::Aes256;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::error::Error as StdErrorT;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const SHARED_SECRET_LENGTH: usize = 32;
pub const PIN_AUTH_LENGTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The peer's coordinates are not a point on P-256.
    InvalidPoint,
    /// Ciphertext or plaintext length is not a multiple of the AES block.
    InvalidBlockLength,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CryptoError::InvalidPoint => write!(f, "CryptoError: invalid P-256 point"),
            CryptoError::InvalidBlockLength => {
                write!(f, "CryptoError: input is not block-aligned")
            }
        }
    }
}

impl StdErrorT for CryptoError {}

/// The platform's ephemeral key pair for one PIN-protocol handshake.
pub struct EphemeralKey {
    secret: SecretKey,
}

impl EphemeralKey {
    pub fn generate() -> Self {
        EphemeralKey {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Uncompressed affine coordinates, ready for the COSE key agreement map.
    pub fn public_coordinates(&self) -> ([u8; 32], [u8; 32]) {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        // An uncompressed P-256 point always carries both coordinates.
        x.copy_from_slice(point.x().expect("uncompressed point").as_slice());
        y.copy_from_slice(point.y().expect("uncompressed point").as_slice());
        (x, y)
    }

    /// Complete the handshake against the authenticator's public key. The
    /// shared secret is SHA-256 of the x-coordinate of the ECDH point.
    pub fn shared_secret(&self, peer_x: &[u8; 32], peer_y: &[u8; 32]) -> Result<SharedSecret, CryptoError> {
        let point = EncodedPoint::from_affine_coordinates(&(*peer_x).into(), &(*peer_y).into(), false);
        let peer: Option<PublicKey> = PublicKey::from_encoded_point(&point).into();
        let peer = peer.ok_or(CryptoError::InvalidPoint)?;
        let ecdh = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let digest = Sha256::digest(ecdh.raw_secret_bytes().as_slice());
        let mut secret = [0u8; SHARED_SECRET_LENGTH];
        secret.copy_from_slice(digest.as_slice());
        Ok(SharedSecret(secret))
    }
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EphemeralKey(redacted)")
    }
}

/// Key material shared with the authenticator for the duration of one PIN
/// operation sequence. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LENGTH]);

impl SharedSecret {
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() || plaintext.len() % 16 != 0 {
            return Err(CryptoError::InvalidBlockLength);
        }
        let iv = [0u8; 16];
        let ciphertext = Aes256CbcEnc::new(&self.0.into(), &iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(plaintext);
        Ok(ciphertext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(CryptoError::InvalidBlockLength);
        }
        let iv = [0u8; 16];
        Aes256CbcDec::new(&self.0.into(), &iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CryptoError::InvalidBlockLength)
    }

    /// First 16 bytes of HMAC-SHA-256 over `data`, keyed by the secret.
    pub fn authenticate(&self, data: &[u8]) -> [u8; PIN_AUTH_LENGTH] {
        authenticate(&self.0, data)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SharedSecret(redacted)")
    }
}

/// First 16 bytes of HMAC-SHA-256 over `data`, keyed by `key`.
pub(crate) fn authenticate(key: &[u8], data: &[u8]) -> [u8; PIN_AUTH_LENGTH] {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key of any length");
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; PIN_AUTH_LENGTH];
    out.copy_from_slice(&digest.as_slice()[..PIN_AUTH_LENGTH]);
    out
}
