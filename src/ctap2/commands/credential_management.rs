/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! authenticatorCredentialManagement (0x0A), plus the pre-standard preview
//! form (0x41) that differs only in command byte.

use super::client_pin::{EmptyResponse, PinAuth, TokenResponse, PIN_PROTOCOL};
use super::{Command, CommandError, RequestCtap2};
use crate::ctap2::server::{PublicKeyCredentialDescriptor, RelyingParty, RpIdHash, User};
use serde::{
    de::{Error as SerdeError, IgnoredAny, MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_bytes::ByteBuf;
use serde_cbor::de::from_slice;
use serde_cbor::ser::to_vec;
use serde_cbor::Value;
use std::fmt;

/// Which command byte the device understands for credential management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialManagementVersion {
    Default,
    Preview,
}

impl CredentialManagementVersion {
    fn command(self) -> Command {
        match self {
            CredentialManagementVersion::Default => Command::CredentialManagement,
            CredentialManagementVersion::Preview => Command::CredentialManagementPreview,
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum CredManSubCommand {
    GetCredsMetadata = 0x01,
    EnumerateRPsBegin = 0x02,
    EnumerateRPsGetNext = 0x03,
    EnumerateCredentialsBegin = 0x04,
    EnumerateCredentialsGetNext = 0x05,
    DeleteCredential = 0x06,
}

#[derive(Debug, Clone)]
enum CredManParams {
    RpIdHash(RpIdHash),
    CredentialId(PublicKeyCredentialDescriptor),
}

impl Serialize for CredManParams {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            CredManParams::RpIdHash(hash) => {
                map.serialize_entry(&1, &ByteBuf::from(hash.0.to_vec()))?;
            }
            CredManParams::CredentialId(descriptor) => {
                map.serialize_entry(&2, descriptor)?;
            }
        }
        map.end()
    }
}

/// The request map shared by all subcommands.
#[derive(Debug)]
struct CredentialManagement {
    version: CredentialManagementVersion,
    subcommand: CredManSubCommand,
    params: Option<CredManParams>,
    pin_auth: Option<PinAuth>,
}

impl CredentialManagement {
    fn new(
        version: CredentialManagementVersion,
        subcommand: CredManSubCommand,
        params: Option<CredManParams>,
    ) -> Self {
        CredentialManagement {
            version,
            subcommand,
            params,
            pin_auth: None,
        }
    }

    /// pinAuth covers `subCommand || CBOR(subCommandParams)`.
    fn authenticate(mut self, pin_token: &TokenResponse) -> Result<Self, CommandError> {
        let mut data = vec![self.subcommand as u8];
        if let Some(ref params) = self.params {
            data.extend(to_vec(params).map_err(CommandError::Serializing)?);
        }
        self.pin_auth = Some(pin_token.pin_auth(&data));
        Ok(self)
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        to_vec(self).map_err(CommandError::Serializing)
    }
}

impl Serialize for CredentialManagement {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map_len = 1;
        if self.params.is_some() {
            map_len += 1;
        }
        if self.pin_auth.is_some() {
            map_len += 2;
        }

        let mut map = serializer.serialize_map(Some(map_len))?;
        map.serialize_entry(&1, &(self.subcommand as u8))?;
        if let Some(ref params) = self.params {
            map.serialize_entry(&2, params)?;
        }
        if let Some(ref pin_auth) = self.pin_auth {
            map.serialize_entry(&3, &PIN_PROTOCOL)?;
            map.serialize_entry(&4, pin_auth)?;
        }
        map.end()
    }
}

/// Every field a credential management response may carry; the typed
/// responses below pick out and validate their slice.
#[derive(Default)]
struct ResponseFields {
    existing_resident_credentials: Option<u64>,
    max_possible_remaining: Option<u64>,
    rp: Option<RelyingParty>,
    rp_id_hash: Option<ByteBuf>,
    total_rps: Option<u64>,
    user: Option<User>,
    credential_id: Option<PublicKeyCredentialDescriptor>,
    public_key: Option<Value>,
    total_credentials: Option<u64>,
    cred_protect: Option<u8>,
}

impl<'de> Deserialize<'de> for ResponseFields {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ResponseFieldsVisitor;

        impl<'de> Visitor<'de> for ResponseFieldsVisitor {
            type Value = ResponseFields;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut fields = ResponseFields::default();
                while let Some(key) = map.next_key()? {
                    match key {
                        0x01 => {
                            if fields.existing_resident_credentials.is_some() {
                                return Err(SerdeError::duplicate_field(
                                    "existing_resident_credentials",
                                ));
                            }
                            fields.existing_resident_credentials = Some(map.next_value()?);
                        }
                        0x02 => {
                            if fields.max_possible_remaining.is_some() {
                                return Err(SerdeError::duplicate_field(
                                    "max_possible_remaining",
                                ));
                            }
                            fields.max_possible_remaining = Some(map.next_value()?);
                        }
                        0x03 => {
                            if fields.rp.is_some() {
                                return Err(SerdeError::duplicate_field("rp"));
                            }
                            fields.rp = Some(map.next_value()?);
                        }
                        0x04 => {
                            if fields.rp_id_hash.is_some() {
                                return Err(SerdeError::duplicate_field("rp_id_hash"));
                            }
                            fields.rp_id_hash = Some(map.next_value()?);
                        }
                        0x05 => {
                            if fields.total_rps.is_some() {
                                return Err(SerdeError::duplicate_field("total_rps"));
                            }
                            fields.total_rps = Some(map.next_value()?);
                        }
                        0x06 => {
                            if fields.user.is_some() {
                                return Err(SerdeError::duplicate_field("user"));
                            }
                            fields.user = Some(map.next_value()?);
                        }
                        0x07 => {
                            if fields.credential_id.is_some() {
                                return Err(SerdeError::duplicate_field("credential_id"));
                            }
                            fields.credential_id = Some(map.next_value()?);
                        }
                        0x08 => {
                            if fields.public_key.is_some() {
                                return Err(SerdeError::duplicate_field("public_key"));
                            }
                            fields.public_key = Some(map.next_value()?);
                        }
                        0x09 => {
                            if fields.total_credentials.is_some() {
                                return Err(SerdeError::duplicate_field("total_credentials"));
                            }
                            fields.total_credentials = Some(map.next_value()?);
                        }
                        0x0A => {
                            if fields.cred_protect.is_some() {
                                return Err(SerdeError::duplicate_field("cred_protect"));
                            }
                            fields.cred_protect = Some(map.next_value()?);
                        }
                        k => {
                            warn!("CredentialManagement response: ignoring unknown key {}", k);
                            let _ = map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(fields)
            }
        }

        deserializer.deserialize_bytes(ResponseFieldsVisitor)
    }
}

fn rp_id_hash_from(buf: ByteBuf) -> Result<RpIdHash, CommandError> {
    if buf.len() != 32 {
        return Err(CommandError::MissingRequiredField("rp_id_hash"));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&buf);
    Ok(RpIdHash(hash))
}

#[derive(Debug)]
pub struct CredentialsMetadataRequest {
    wire: CredentialManagement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialsMetadataResponse {
    pub existing_resident_credentials: u64,
    pub max_possible_remaining: u64,
}

impl CredentialsMetadataRequest {
    pub fn new(
        version: CredentialManagementVersion,
        pin_token: &TokenResponse,
    ) -> Result<Self, CommandError> {
        let wire =
            CredentialManagement::new(version, CredManSubCommand::GetCredsMetadata, None)
                .authenticate(pin_token)?;
        Ok(CredentialsMetadataRequest { wire })
    }
}

impl RequestCtap2 for CredentialsMetadataRequest {
    type Output = CredentialsMetadataResponse;

    fn command(&self) -> Command {
        self.wire.version.command()
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        self.wire.wire_format()
    }

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        let fields: ResponseFields = from_slice(body).map_err(CommandError::Deserializing)?;
        Ok(CredentialsMetadataResponse {
            existing_resident_credentials: fields
                .existing_resident_credentials
                .ok_or(CommandError::MissingRequiredField("existing_resident_credentials"))?,
            max_possible_remaining: fields
                .max_possible_remaining
                .ok_or(CommandError::MissingRequiredField("max_possible_remaining"))?,
        })
    }
}

#[derive(Debug)]
pub struct EnumerateRPsRequest {
    wire: CredentialManagement,
    expect_rp_count: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumerateRPsResponse {
    pub rp: Option<RelyingParty>,
    pub rp_id_hash: Option<RpIdHash>,
    /// Total number of relying parties; only present on the first page and
    /// zero afterwards.
    pub rp_count: u64,
}

impl EnumerateRPsRequest {
    pub fn begin(
        version: CredentialManagementVersion,
        pin_token: &TokenResponse,
    ) -> Result<Self, CommandError> {
        let wire =
            CredentialManagement::new(version, CredManSubCommand::EnumerateRPsBegin, None)
                .authenticate(pin_token)?;
        Ok(EnumerateRPsRequest {
            wire,
            expect_rp_count: true,
        })
    }

    pub fn get_next(version: CredentialManagementVersion) -> Self {
        EnumerateRPsRequest {
            wire: CredentialManagement::new(version, CredManSubCommand::EnumerateRPsGetNext, None),
            expect_rp_count: false,
        }
    }
}

impl RequestCtap2 for EnumerateRPsRequest {
    type Output = EnumerateRPsResponse;

    fn command(&self) -> Command {
        self.wire.version.command()
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        self.wire.wire_format()
    }

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        if body.is_empty() && self.expect_rp_count {
            // Some devices answer an empty body instead of totalRPs = 0.
            return Ok(EnumerateRPsResponse {
                rp: None,
                rp_id_hash: None,
                rp_count: 0,
            });
        }
        let fields: ResponseFields = from_slice(body).map_err(CommandError::Deserializing)?;
        let rp_count = if self.expect_rp_count {
            fields
                .total_rps
                .ok_or(CommandError::MissingRequiredField("total_rps"))?
        } else {
            // The count is captured from the first page alone; a count on a
            // later page cannot be trusted to be consistent.
            if fields.total_rps.is_some() {
                return Err(CommandError::UnexpectedField("total_rps"));
            }
            0
        };

        let rp_id_hash = fields.rp_id_hash.map(rp_id_hash_from).transpose()?;
        if (rp_count > 0 || !self.expect_rp_count)
            && (fields.rp.is_none() || rp_id_hash.is_none())
        {
            return Err(CommandError::MissingRequiredField("rp"));
        }

        Ok(EnumerateRPsResponse {
            rp: fields.rp,
            rp_id_hash,
            rp_count,
        })
    }
}

#[derive(Debug)]
pub struct EnumerateCredentialsRequest {
    wire: CredentialManagement,
    expect_credential_count: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumerateCredentialsResponse {
    pub user: User,
    pub credential_id: PublicKeyCredentialDescriptor,
    pub public_key: Option<Value>,
    pub cred_protect: Option<u8>,
    /// Number of credentials for the current RP; only present on the first
    /// page and zero afterwards.
    pub credential_count: u64,
}

impl EnumerateCredentialsRequest {
    pub fn begin(
        version: CredentialManagementVersion,
        pin_token: &TokenResponse,
        rp_id_hash: RpIdHash,
    ) -> Result<Self, CommandError> {
        let wire = CredentialManagement::new(
            version,
            CredManSubCommand::EnumerateCredentialsBegin,
            Some(CredManParams::RpIdHash(rp_id_hash)),
        )
        .authenticate(pin_token)?;
        Ok(EnumerateCredentialsRequest {
            wire,
            expect_credential_count: true,
        })
    }

    pub fn get_next(version: CredentialManagementVersion) -> Self {
        EnumerateCredentialsRequest {
            wire: CredentialManagement::new(
                version,
                CredManSubCommand::EnumerateCredentialsGetNext,
                None,
            ),
            expect_credential_count: false,
        }
    }
}

impl RequestCtap2 for EnumerateCredentialsRequest {
    type Output = EnumerateCredentialsResponse;

    fn command(&self) -> Command {
        self.wire.version.command()
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        self.wire.wire_format()
    }

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        let fields: ResponseFields = from_slice(body).map_err(CommandError::Deserializing)?;
        let credential_count = if self.expect_credential_count {
            fields
                .total_credentials
                .ok_or(CommandError::MissingRequiredField("total_credentials"))?
        } else {
            if fields.total_credentials.is_some() {
                return Err(CommandError::UnexpectedField("total_credentials"));
            }
            0
        };
        Ok(EnumerateCredentialsResponse {
            user: fields
                .user
                .ok_or(CommandError::MissingRequiredField("user"))?,
            credential_id: fields
                .credential_id
                .ok_or(CommandError::MissingRequiredField("credential_id"))?,
            public_key: fields.public_key,
            cred_protect: fields.cred_protect,
            credential_count,
        })
    }
}

#[derive(Debug)]
pub struct DeleteCredentialRequest {
    wire: CredentialManagement,
}

pub type DeleteCredentialResponse = EmptyResponse;

impl DeleteCredentialRequest {
    pub fn new(
        version: CredentialManagementVersion,
        pin_token: &TokenResponse,
        credential_id: PublicKeyCredentialDescriptor,
    ) -> Result<Self, CommandError> {
        let wire = CredentialManagement::new(
            version,
            CredManSubCommand::DeleteCredential,
            Some(CredManParams::CredentialId(credential_id)),
        )
        .authenticate(pin_token)?;
        Ok(DeleteCredentialRequest { wire })
    }
}

impl RequestCtap2 for DeleteCredentialRequest {
    type Output = DeleteCredentialResponse;

    fn command(&self) -> Command {
        self.wire.version.command()
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        self.wire.wire_format()
    }

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        if body.is_empty() {
            Ok(EmptyResponse {})
        } else {
            Err(CommandError::UnexpectedField("non-empty response body"))
        }
    }
}

/// One relying party and every resident credential it holds, as assembled by
/// the enumeration state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedEnumerateCredentialsResponse {
    pub rp: RelyingParty,
    pub rp_id_hash: RpIdHash,
    pub credentials: Vec<EnumerateCredentialsResponse>,
}
