/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::ctap2::commands::get_info::AAGuid;
use crate::ctap2::commands::CommandError;
use crate::ctap2::server::RpIdHash;
use bitflags::bitflags;
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::IResult;
use serde::de::{Error as SerdeError, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_cbor::Value;
use std::collections::BTreeMap;
use std::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuthenticatorDataFlags: u8 {
        const USER_PRESENT = 0x01;
        const USER_VERIFIED = 0x04;
        const ATTESTED_CREDENTIAL_DATA = 0x40;
        const EXTENSION_DATA = 0x80;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttestedCredentialData {
    pub aaguid: AAGuid,
    pub credential_id: Vec<u8>,
    /// COSE key of the newly minted credential, kept as parsed CBOR; key
    /// algebra is the verifier's concern.
    pub credential_public_key: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatorData {
    pub rp_id_hash: RpIdHash,
    pub flags: AuthenticatorDataFlags,
    pub counter: u32,
    pub credential_data: Option<AttestedCredentialData>,
    pub extensions: Option<Value>,
}

fn parse_fixed(i: &[u8]) -> IResult<&[u8], (&[u8], u8, u32)> {
    let (i, rp_id_hash) = take(32usize)(i)?;
    let (i, flags) = be_u8(i)?;
    let (i, counter) = be_u32(i)?;
    Ok((i, (rp_id_hash, flags, counter)))
}

fn parse_attested_prefix(i: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (i, aaguid) = take(16usize)(i)?;
    let (i, id_len) = be_u16(i)?;
    let (i, credential_id) = take(usize::from(id_len))(i)?;
    Ok((i, (aaguid, credential_id)))
}

impl AuthenticatorData {
    pub fn parse(input: &[u8]) -> Result<Self, CommandError> {
        let (rest, (hash, flags, counter)) =
            parse_fixed(input).map_err(|_| CommandError::InputTooSmall)?;
        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(hash);
        let flags = AuthenticatorDataFlags::from_bits_truncate(flags);

        let mut rest = rest;
        let credential_data = if flags.contains(AuthenticatorDataFlags::ATTESTED_CREDENTIAL_DATA) {
            let (after, (aaguid, credential_id)) =
                parse_attested_prefix(rest).map_err(|_| CommandError::InputTooSmall)?;
            // The COSE key has no length prefix; decode one CBOR item and
            // carry on from wherever it ended.
            let mut deserializer = serde_cbor::Deserializer::from_slice(after);
            let credential_public_key = Value::deserialize(&mut deserializer)
                .map_err(CommandError::Deserializing)?;
            rest = &after[deserializer.byte_offset()..];
            Some(AttestedCredentialData {
                aaguid: AAGuid::from(aaguid).map_err(|_| CommandError::InputTooSmall)?,
                credential_id: credential_id.to_vec(),
                credential_public_key,
            })
        } else {
            None
        };

        let extensions = if flags.contains(AuthenticatorDataFlags::EXTENSION_DATA) {
            let value = serde_cbor::from_slice(rest).map_err(CommandError::Deserializing)?;
            rest = &[];
            Some(value)
        } else {
            None
        };

        if !rest.is_empty() {
            return Err(CommandError::UnexpectedField("authData trailing bytes"));
        }

        Ok(AuthenticatorData {
            rp_id_hash: RpIdHash(rp_id_hash),
            flags,
            counter,
            credential_data,
            extensions,
        })
    }
}

impl<'de> Deserialize<'de> for AuthenticatorData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AuthenticatorDataVisitor;

        impl<'de> Visitor<'de> for AuthenticatorDataVisitor {
            type Value = AuthenticatorData;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte array")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: SerdeError,
            {
                AuthenticatorData::parse(v).map_err(|e| E::custom(format!("{}", e)))
            }
        }

        deserializer.deserialize_bytes(AuthenticatorDataVisitor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttestationObject {
    pub fmt: String,
    pub auth_data: AuthenticatorData,
    pub att_stmt: Value,
}

impl AttestationObject {
    /// Assemble the fido-u2f attestation shape from a parsed U2F
    /// registration message.
    pub(crate) fn from_u2f_register(
        rp_id_hash: RpIdHash,
        public_key: &[u8],
        key_handle: &[u8],
        certificate: &[u8],
        signature: &[u8],
    ) -> Self {
        let mut att_stmt = BTreeMap::new();
        att_stmt.insert(
            Value::Text("sig".to_string()),
            Value::Bytes(signature.to_vec()),
        );
        att_stmt.insert(
            Value::Text("x5c".to_string()),
            Value::Array(vec![Value::Bytes(certificate.to_vec())]),
        );

        let auth_data = AuthenticatorData {
            rp_id_hash,
            flags: AuthenticatorDataFlags::USER_PRESENT
                | AuthenticatorDataFlags::ATTESTED_CREDENTIAL_DATA,
            counter: 0,
            credential_data: Some(AttestedCredentialData {
                aaguid: AAGuid::empty(),
                credential_id: key_handle.to_vec(),
                credential_public_key: cose_p256_key(public_key),
            }),
            extensions: None,
        };

        AttestationObject {
            fmt: "fido-u2f".to_string(),
            auth_data,
            att_stmt: Value::Map(att_stmt),
        }
    }
}

/// COSE EC2/P-256 map for a 65-byte uncompressed point (0x04 || x || y).
fn cose_p256_key(uncompressed: &[u8]) -> Value {
    let mut map = BTreeMap::new();
    map.insert(Value::Integer(1), Value::Integer(2)); // kty: EC2
    map.insert(Value::Integer(3), Value::Integer(-7)); // alg: ES256
    map.insert(Value::Integer(-1), Value::Integer(1)); // crv: P-256
    if uncompressed.len() == 65 {
        map.insert(Value::Integer(-2), Value::Bytes(uncompressed[1..33].to_vec()));
        map.insert(Value::Integer(-3), Value::Bytes(uncompressed[33..65].to_vec()));
    }
    Value::Map(map)
}

impl<'de> Deserialize<'de> for AttestationObject {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AttestationObjectVisitor;

        impl<'de> Visitor<'de> for AttestationObjectVisitor {
            type Value = AttestationObject;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut fmt_entry = None;
                let mut auth_data = None;
                let mut att_stmt = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        1 => {
                            if fmt_entry.is_some() {
                                return Err(SerdeError::duplicate_field("fmt"));
                            }
                            fmt_entry = Some(map.next_value()?);
                        }
                        2 => {
                            if auth_data.is_some() {
                                return Err(SerdeError::duplicate_field("auth_data"));
                            }
                            auth_data = Some(map.next_value()?);
                        }
                        3 => {
                            if att_stmt.is_some() {
                                return Err(SerdeError::duplicate_field("att_stmt"));
                            }
                            att_stmt = Some(map.next_value()?);
                        }
                        k => return Err(M::Error::custom(format!("unexpected key: {:?}", k))),
                    }
                }

                let fmt_entry = fmt_entry.ok_or_else(|| M::Error::missing_field("fmt"))?;
                let auth_data = auth_data.ok_or_else(|| M::Error::missing_field("auth_data"))?;
                let att_stmt = att_stmt.ok_or_else(|| M::Error::missing_field("att_stmt"))?;

                Ok(AttestationObject {
                    fmt: fmt_entry,
                    auth_data,
                    att_stmt,
                })
            }
        }

        deserializer.deserialize_bytes(AttestationObjectVisitor)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    // rpIdHash || flags(UP|AT) || counter || aaguid || idLen=4 || id || COSE key
    fn sample_auth_data() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x11; 32]);
        data.push(0x41);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x2A]);
        data.extend_from_slice(&[0x22; 16]);
        data.extend_from_slice(&[0x00, 0x04]);
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        // {1: 2} standing in for a COSE key
        data.extend_from_slice(&[0xA1, 0x01, 0x02]);
        data
    }

    #[test]
    fn parses_attested_credential_data() {
        let parsed = AuthenticatorData::parse(&sample_auth_data()).unwrap();
        assert_eq!(parsed.rp_id_hash, RpIdHash([0x11; 32]));
        assert_eq!(
            parsed.flags,
            AuthenticatorDataFlags::USER_PRESENT
                | AuthenticatorDataFlags::ATTESTED_CREDENTIAL_DATA
        );
        assert_eq!(parsed.counter, 42);
        let cred = parsed.credential_data.unwrap();
        assert_eq!(cred.credential_id, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert!(parsed.extensions.is_none());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut data = sample_auth_data();
        data.push(0x00);
        assert!(AuthenticatorData::parse(&data).is_err());
    }

    #[test]
    fn parses_plain_assertion_data() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x33; 32]);
        data.push(0x01);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x07]);
        let parsed = AuthenticatorData::parse(&data).unwrap();
        assert_eq!(parsed.flags, AuthenticatorDataFlags::USER_PRESENT);
        assert_eq!(parsed.counter, 7);
        assert!(parsed.credential_data.is_none());
    }
}
