/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::{Command, CommandError, RequestCtap2};
use crate::apdu::{self, U2F_AUTHENTICATE, U2F_CHECK_IS_REGISTERED, U2F_REQUEST_USER_PRESENCE};
use crate::ctap2::attestation::{AuthenticatorData, AuthenticatorDataFlags};
use crate::ctap2::commands::client_pin::{PinAuth, PIN_PROTOCOL};
use crate::ctap2::server::{
    ClientDataHash, PublicKeyCredentialDescriptor, RelyingParty, User,
    UserVerificationRequirement,
};
use serde::{
    de::{Error as SerdeError, IgnoredAny, MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_bytes::ByteBuf;
use serde_cbor::de::from_slice;
use serde_cbor::ser::to_vec;
use std::fmt;

#[derive(Debug, Copy, Clone, Default, Serialize)]
pub struct GetAssertionOptions {
    #[serde(rename = "up", skip_serializing_if = "Option::is_none")]
    pub user_presence: Option<bool>,
    #[serde(rename = "uv", skip_serializing_if = "Option::is_none")]
    pub user_verification: Option<bool>,
}

impl GetAssertionOptions {
    pub(crate) fn has_some(&self) -> bool {
        self.user_presence.is_some() || self.user_verification.is_some()
    }
}

#[derive(Debug)]
pub struct GetAssertion {
    pub client_data_hash: ClientDataHash,
    pub rp: RelyingParty,
    pub allow_list: Vec<PublicKeyCredentialDescriptor>,
    pub options: GetAssertionOptions,
    pub pin_auth: Option<PinAuth>,
    /// What the relying party asked for; drives the PIN disposition, never
    /// serialized.
    pub user_verification_req: UserVerificationRequirement,
}

impl GetAssertion {
    pub fn new(
        client_data_hash: ClientDataHash,
        rp: RelyingParty,
        allow_list: Vec<PublicKeyCredentialDescriptor>,
        options: GetAssertionOptions,
        user_verification_req: UserVerificationRequirement,
    ) -> Self {
        Self {
            client_data_hash,
            rp,
            allow_list,
            options,
            pin_auth: None,
            user_verification_req,
        }
    }

    pub fn set_pin_auth(&mut self, pin_auth: PinAuth) {
        self.pin_auth = Some(pin_auth);
    }

    /// True for a resident-key request: with no allow list the device has to
    /// look the credential up itself, which mandates user verification.
    pub fn is_resident_key_request(&self) -> bool {
        self.allow_list.is_empty()
    }

    fn u2f_sign_data(&self, key_handle: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(65 + key_handle.len());
        data.extend_from_slice(self.client_data_hash.as_ref());
        data.extend_from_slice(self.rp.hash().as_ref());
        data.push(key_handle.len() as u8);
        data.extend_from_slice(key_handle);
        data
    }

    /// Check-only probe: asks whether this key handle belongs to the device
    /// without exercising user presence.
    pub(crate) fn u2f_check_frame(&self, key_handle: &[u8]) -> Vec<u8> {
        apdu::apdu_frame(
            U2F_AUTHENTICATE,
            U2F_CHECK_IS_REGISTERED,
            &self.u2f_sign_data(key_handle),
        )
    }

    pub(crate) fn u2f_sign_frame(&self, key_handle: &[u8]) -> Vec<u8> {
        apdu::apdu_frame(
            U2F_AUTHENTICATE,
            U2F_REQUEST_USER_PRESENCE,
            &self.u2f_sign_data(key_handle),
        )
    }

    pub(crate) fn parse_u2f_response(
        &self,
        key_handle: &[u8],
        payload: &[u8],
    ) -> Result<GetAssertionResponse, CommandError> {
        let sign = apdu::parse_sign_response(payload)?;
        let mut flags = AuthenticatorDataFlags::empty();
        if sign.user_presence == 1 {
            flags |= AuthenticatorDataFlags::USER_PRESENT;
        }
        Ok(GetAssertionResponse {
            credentials: Some(PublicKeyCredentialDescriptor::new(key_handle.to_vec())),
            auth_data: AuthenticatorData {
                rp_id_hash: self.rp.hash(),
                flags,
                counter: sign.counter,
                credential_data: None,
                extensions: None,
            },
            signature: sign.signature.to_vec(),
            user: None,
            number_of_credentials: None,
        })
    }
}

impl Serialize for GetAssertion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Need to define how many elements are going to be in the map
        // beforehand
        let mut map_len = 2;
        if !self.allow_list.is_empty() {
            map_len += 1;
        }
        if self.options.has_some() {
            map_len += 1;
        }
        if self.pin_auth.is_some() {
            map_len += 2;
        }

        let mut map = serializer.serialize_map(Some(map_len))?;
        map.serialize_entry(&1, &self.rp.id)?;
        map.serialize_entry(&2, &self.client_data_hash)?;
        if !self.allow_list.is_empty() {
            map.serialize_entry(&3, &self.allow_list)?;
        }
        if self.options.has_some() {
            map.serialize_entry(&5, &self.options)?;
        }
        if let Some(pin_auth) = &self.pin_auth {
            map.serialize_entry(&6, &pin_auth)?;
            map.serialize_entry(&7, &PIN_PROTOCOL)?;
        }
        map.end()
    }
}

impl RequestCtap2 for GetAssertion {
    type Output = GetAssertionResponse;

    fn command(&self) -> Command {
        Command::GetAssertion
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        to_vec(&self).map_err(CommandError::Serializing)
    }

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        if body.is_empty() {
            return Err(CommandError::InputTooSmall);
        }
        from_slice(body).map_err(CommandError::Deserializing)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetAssertionResponse {
    pub credentials: Option<PublicKeyCredentialDescriptor>,
    pub auth_data: AuthenticatorData,
    pub signature: Vec<u8>,
    pub user: Option<User>,
    pub number_of_credentials: Option<usize>,
}

impl<'de> Deserialize<'de> for GetAssertionResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct GetAssertionResponseVisitor;

        impl<'de> Visitor<'de> for GetAssertionResponseVisitor {
            type Value = GetAssertionResponse;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut credentials = None;
                let mut auth_data = None;
                let mut signature = None;
                let mut user = None;
                let mut number_of_credentials = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        1 => {
                            if credentials.is_some() {
                                return Err(SerdeError::duplicate_field("credentials"));
                            }
                            credentials = Some(map.next_value()?);
                        }
                        2 => {
                            if auth_data.is_some() {
                                return Err(SerdeError::duplicate_field("auth_data"));
                            }
                            auth_data = Some(map.next_value()?);
                        }
                        3 => {
                            if signature.is_some() {
                                return Err(SerdeError::duplicate_field("signature"));
                            }
                            let bytes: ByteBuf = map.next_value()?;
                            signature = Some(bytes.into_vec());
                        }
                        4 => {
                            if user.is_some() {
                                return Err(SerdeError::duplicate_field("user"));
                            }
                            user = Some(map.next_value()?);
                        }
                        5 => {
                            if number_of_credentials.is_some() {
                                return Err(SerdeError::duplicate_field("number_of_credentials"));
                            }
                            number_of_credentials = Some(map.next_value()?);
                        }
                        k => {
                            warn!("GetAssertionResponse: ignoring unknown key {}", k);
                            let _ = map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                let auth_data =
                    auth_data.ok_or_else(|| M::Error::missing_field("auth_data"))?;
                let signature =
                    signature.ok_or_else(|| M::Error::missing_field("signature"))?;

                Ok(GetAssertionResponse {
                    credentials,
                    auth_data,
                    signature,
                    user,
                    number_of_credentials,
                })
            }
        }

        deserializer.deserialize_bytes(GetAssertionResponseVisitor)
    }
}
