/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::{Command, CommandError, RequestCtap2};
use crate::apdu::{self, U2F_REGISTER, U2F_REQUEST_USER_PRESENCE};
use crate::ctap2::attestation::AttestationObject;
use crate::ctap2::commands::client_pin::{PinAuth, PIN_PROTOCOL};
use crate::ctap2::server::{
    ClientDataHash, PublicKeyCredentialDescriptor, PublicKeyCredentialParameters, RelyingParty,
    User, UserVerificationRequirement,
};
use serde::{ser::SerializeMap, Serialize, Serializer};
use serde_cbor::de::from_slice;
use serde_cbor::ser::to_vec;

#[derive(Debug, Copy, Clone, Default, Serialize)]
pub struct MakeCredentialsOptions {
    #[serde(rename = "rk", skip_serializing_if = "Option::is_none")]
    pub resident_key: Option<bool>,
    #[serde(rename = "uv", skip_serializing_if = "Option::is_none")]
    pub user_verification: Option<bool>,
}

impl MakeCredentialsOptions {
    pub(crate) fn has_some(&self) -> bool {
        self.resident_key.is_some() || self.user_verification.is_some()
    }
}

#[derive(Debug)]
pub struct MakeCredentials {
    pub client_data_hash: ClientDataHash,
    pub rp: RelyingParty,
    pub user: User,
    pub pub_cred_params: Vec<PublicKeyCredentialParameters>,
    pub exclude_list: Vec<PublicKeyCredentialDescriptor>,
    pub options: MakeCredentialsOptions,
    pub pin_auth: Option<PinAuth>,
    /// What the relying party asked for; drives the PIN disposition, never
    /// serialized.
    pub user_verification_req: UserVerificationRequirement,
}

impl MakeCredentials {
    pub fn new(
        client_data_hash: ClientDataHash,
        rp: RelyingParty,
        user: User,
        pub_cred_params: Vec<PublicKeyCredentialParameters>,
        exclude_list: Vec<PublicKeyCredentialDescriptor>,
        options: MakeCredentialsOptions,
        user_verification_req: UserVerificationRequirement,
    ) -> Self {
        Self {
            client_data_hash,
            rp,
            user,
            pub_cred_params,
            exclude_list,
            options,
            pin_auth: None,
            user_verification_req,
        }
    }

    pub fn set_pin_auth(&mut self, pin_auth: PinAuth) {
        self.pin_auth = Some(pin_auth);
    }

    /// The degenerate request used purely to sense a touch. The zero-length
    /// pinAuth makes any PIN-capable device answer with a PIN error right
    /// after user presence, and `.dummy` never collides with a real RP.
    pub fn dummy_touch_request() -> Self {
        let mut request = MakeCredentials::new(
            ClientDataHash([0u8; 32]),
            RelyingParty::from_id(".dummy"),
            User {
                id: vec![0x00],
                name: Some("dummy".to_string()),
                display_name: None,
                icon: None,
            },
            vec![PublicKeyCredentialParameters::es256()],
            Vec::new(),
            MakeCredentialsOptions::default(),
            UserVerificationRequirement::Discouraged,
        );
        request.set_pin_auth(PinAuth::empty());
        request
    }

    /// The U2F_REGISTER fallback frame for dual-protocol devices.
    pub(crate) fn u2f_frame(&self) -> Vec<u8> {
        let mut register_data = Vec::with_capacity(64);
        register_data.extend_from_slice(self.client_data_hash.as_ref());
        register_data.extend_from_slice(self.rp.hash().as_ref());
        apdu::apdu_frame(U2F_REGISTER, U2F_REQUEST_USER_PRESENCE, &register_data)
    }

    pub(crate) fn parse_u2f_response(
        &self,
        payload: &[u8],
    ) -> Result<AttestationObject, CommandError> {
        let register = apdu::parse_register_response(payload)?;
        Ok(AttestationObject::from_u2f_register(
            self.rp.hash(),
            register.public_key,
            register.key_handle,
            register.certificate,
            register.signature,
        ))
    }
}

impl Serialize for MakeCredentials {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Need to define how many elements are going to be in the map
        // beforehand
        let mut map_len = 4;
        if !self.exclude_list.is_empty() {
            map_len += 1;
        }
        if self.options.has_some() {
            map_len += 1;
        }
        if self.pin_auth.is_some() {
            map_len += 2;
        }

        let mut map = serializer.serialize_map(Some(map_len))?;
        map.serialize_entry(&1, &self.client_data_hash)?;
        map.serialize_entry(&2, &self.rp)?;
        map.serialize_entry(&3, &self.user)?;
        map.serialize_entry(&4, &self.pub_cred_params)?;
        if !self.exclude_list.is_empty() {
            map.serialize_entry(&5, &self.exclude_list)?;
        }
        if self.options.has_some() {
            map.serialize_entry(&7, &self.options)?;
        }
        if let Some(pin_auth) = &self.pin_auth {
            map.serialize_entry(&8, &pin_auth)?;
            map.serialize_entry(&9, &PIN_PROTOCOL)?;
        }
        map.end()
    }
}

impl RequestCtap2 for MakeCredentials {
    type Output = AttestationObject;

    fn command(&self) -> Command {
        Command::MakeCredentials
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
