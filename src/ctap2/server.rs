/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Types supplied by the relying party side of a request. The request
//! handler above this crate assembles them; commands serialize them into the
//! wire maps the authenticator expects.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelyingParty {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl RelyingParty {
    pub fn from_id(id: &str) -> Self {
        RelyingParty {
            id: id.to_string(),
            name: None,
            icon: None,
        }
    }

    /// SHA-256 of the RP id, as used in U2F application parameters and
    /// authenticator data.
    pub fn hash(&self) -> RpIdHash {
        let digest = Sha256::digest(self.id.as_bytes());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(digest.as_slice());
        RpIdHash(hash)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        rename = "displayName",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKeyCredentialParameters {
    pub alg: i64,
    #[serde(rename = "type")]
    pub key_type: String,
}

impl PublicKeyCredentialParameters {
    pub fn es256() -> Self {
        PublicKeyCredentialParameters {
            alg: -7,
            key_type: "public-key".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKeyCredentialDescriptor {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(rename = "type")]
    pub key_type: String,
}

impl PublicKeyCredentialDescriptor {
    pub fn new(id: Vec<u8>) -> Self {
        PublicKeyCredentialDescriptor {
            id,
            key_type: "public-key".to_string(),
        }
    }
}

/// The WebAuthn userVerification requirement carried on a request. Not part
/// of the wire encoding; it drives the PIN disposition decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserVerificationRequirement {
    Required,
    Preferred,
    Discouraged,
}

/// SHA-256 of the serialized client data, computed by the request handler.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClientDataHash(pub [u8; 32]);

impl Serialize for ClientDataHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::serialize(&self.0[..], serializer)
    }
}

impl AsRef<[u8]> for ClientDataHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ClientDataHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ClientDataHash({:02x?})", &self.0[..4])
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RpIdHash(pub [u8; 32]);

impl AsRef<[u8]> for RpIdHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RpIdHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RpIdHash({:02x?})", &self.0[..4])
    }
}
