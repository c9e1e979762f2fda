/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! authenticatorBioEnrollment (0x09) and its pre-standard preview alias
//! (0x40). Fingerprints are the only modality the spec defines.

use super::client_pin::{PinAuth, TokenResponse, PIN_PROTOCOL};
use super::{Command, CommandError, RequestCtap2};
use serde::{
    de::{Error as SerdeError, IgnoredAny, MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_bytes::ByteBuf;
use serde_cbor::de::from_slice;
use serde_cbor::ser::to_vec;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioEnrollmentVersion {
    Default,
    Preview,
}

impl BioEnrollmentVersion {
    fn command(self) -> Command {
        match self {
            BioEnrollmentVersion::Default => Command::BioEnrollment,
            BioEnrollmentVersion::Preview => Command::BioEnrollmentPreview,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum BioEnrollmentModality {
    Fingerprint = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum FingerprintKind {
    TouchSensor = 0x01,
    SwipeSensor = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum BioEnrollmentSampleStatus {
    Good = 0x00,
    TooHigh = 0x01,
    TooLow = 0x02,
    TooLeft = 0x03,
    TooRight = 0x04,
    TooFast = 0x05,
    TooSlow = 0x06,
    PoorQuality = 0x07,
    TooSkewed = 0x08,
    TooShort = 0x09,
    MergeFailure = 0x0A,
    Exists = 0x0B,
    DatabaseFull = 0x0C,
    NoUserActivity = 0x0D,
    NoUserPresenceTransition = 0x0E,
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum BioEnrollSubCommand {
    EnrollBegin = 0x01,
    EnrollCaptureNextSample = 0x02,
    CancelCurrentEnrollment = 0x03,
    EnumerateEnrollments = 0x04,
    SetFriendlyName = 0x05,
    RemoveEnrollment = 0x06,
    GetFingerprintSensorInfo = 0x07,
}

#[derive(Debug, Clone, Default)]
struct BioEnrollmentParams {
    template_id: Option<ByteBuf>,
    template_friendly_name: Option<String>,
    timeout_milliseconds: Option<u64>,
}

impl BioEnrollmentParams {
    fn has_some(&self) -> bool {
        self.template_id.is_some()
            || self.template_friendly_name.is_some()
            || self.timeout_milliseconds.is_some()
    }
}

impl Serialize for BioEnrollmentParams {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map_len = 0;
        if self.template_id.is_some() {
            map_len += 1;
        }
        if self.template_friendly_name.is_some() {
            map_len += 1;
        }
        if self.timeout_milliseconds.is_some() {
            map_len += 1;
        }

        let mut map = serializer.serialize_map(Some(map_len))?;
        if let Some(ref template_id) = self.template_id {
            map.serialize_entry(&0x01, template_id)?;
        }
        if let Some(ref name) = self.template_friendly_name {
            map.serialize_entry(&0x02, name)?;
        }
        if let Some(ref timeout) = self.timeout_milliseconds {
            map.serialize_entry(&0x03, timeout)?;
        }
        map.end()
    }
}

#[derive(Debug)]
pub struct BioEnrollmentRequest {
    version: BioEnrollmentVersion,
    modality: Option<BioEnrollmentModality>,
    subcommand: Option<BioEnrollSubCommand>,
    params: Option<BioEnrollmentParams>,
    pin_auth: Option<PinAuth>,
    get_modality: Option<bool>,
}

impl BioEnrollmentRequest {
    fn new(version: BioEnrollmentVersion) -> Self {
        BioEnrollmentRequest {
            version,
            modality: None,
            subcommand: None,
            params: None,
            pin_auth: None,
            get_modality: None,
        }
    }

    fn fingerprint(version: BioEnrollmentVersion, subcommand: BioEnrollSubCommand) -> Self {
        let mut request = Self::new(version);
        request.modality = Some(BioEnrollmentModality::Fingerprint);
        request.subcommand = Some(subcommand);
        request
    }

    /// pinAuth covers `modality || subCommand || CBOR(subCommandParams)`.
    fn authenticate(mut self, pin_token: &TokenResponse) -> Result<Self, CommandError> {
        let modality = self.modality.expect("authenticated requests carry a modality") as u8;
        let subcommand = self.subcommand.expect("authenticated requests carry a subcommand") as u8;
        let mut data = vec![modality, subcommand];
        if let Some(ref params) = self.params {
            if params.has_some() {
                data.extend(to_vec(params).map_err(CommandError::Serializing)?);
            }
        }
        self.pin_auth = Some(pin_token.pin_auth(&data));
        Ok(self)
    }

    pub fn for_get_modality(version: BioEnrollmentVersion) -> Self {
        let mut request = Self::new(version);
        request.get_modality = Some(true);
        request
    }

    pub fn for_get_sensor_info(version: BioEnrollmentVersion) -> Self {
        Self::fingerprint(version, BioEnrollSubCommand::GetFingerprintSensorInfo)
    }

    pub fn for_enroll_begin(
        version: BioEnrollmentVersion,
        pin_token: &TokenResponse,
    ) -> Result<Self, CommandError> {
        Self::fingerprint(version, BioEnrollSubCommand::EnrollBegin).authenticate(pin_token)
    }

    pub fn for_enroll_next_sample(
        version: BioEnrollmentVersion,
        pin_token: &TokenResponse,
        template_id: Vec<u8>,
    ) -> Result<Self, CommandError> {
        let mut request =
            Self::fingerprint(version, BioEnrollSubCommand::EnrollCaptureNextSample);
        request.params = Some(BioEnrollmentParams {
            template_id: Some(ByteBuf::from(template_id)),
            ..BioEnrollmentParams::default()
        });
        request.authenticate(pin_token)
    }

    pub fn for_cancel(version: BioEnrollmentVersion) -> Self {
        Self::fingerprint(version, BioEnrollSubCommand::CancelCurrentEnrollment)
    }

    pub fn for_enumerate(
        version: BioEnrollmentVersion,
        pin_token: &TokenResponse,
    ) -> Result<Self, CommandError> {
        Self::fingerprint(version, BioEnrollSubCommand::EnumerateEnrollments)
            .authenticate(pin_token)
    }

    pub fn for_rename(
        version: BioEnrollmentVersion,
        pin_token: &TokenResponse,
        template_id: Vec<u8>,
        name: String,
    ) -> Result<Self, CommandError> {
        let mut request = Self::fingerprint(version, BioEnrollSubCommand::SetFriendlyName);
        request.params = Some(BioEnrollmentParams {
            template_id: Some(ByteBuf::from(template_id)),
            template_friendly_name: Some(name),
            ..BioEnrollmentParams::default()
        });
        request.authenticate(pin_token)
    }

    pub fn for_delete(
        version: BioEnrollmentVersion,
        pin_token: &TokenResponse,
        template_id: Vec<u8>,
    ) -> Result<Self, CommandError> {
        let mut request = Self::fingerprint(version, BioEnrollSubCommand::RemoveEnrollment);
        request.params = Some(BioEnrollmentParams {
            template_id: Some(ByteBuf::from(template_id)),
            ..BioEnrollmentParams::default()
        });
        request.authenticate(pin_token)
    }
}

impl Serialize for BioEnrollmentRequest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map_len = 0;
        if self.modality.is_some() {
            map_len += 1;
        }
        if self.subcommand.is_some() {
            map_len += 1;
        }
        if self.params.as_ref().map_or(false, |p| p.has_some()) {
            map_len += 1;
        }
        if self.pin_auth.is_some() {
            map_len += 2;
        }
        if self.get_modality.is_some() {
            map_len += 1;
        }

        let mut map = serializer.serialize_map(Some(map_len))?;
        if let Some(modality) = self.modality {
            map.serialize_entry(&0x01, &modality)?;
        }
        if let Some(subcommand) = self.subcommand {
            map.serialize_entry(&0x02, &(subcommand as u8))?;
        }
        if let Some(ref params) = self.params {
            if params.has_some() {
                map.serialize_entry(&0x03, params)?;
            }
        }
        if let Some(ref pin_auth) = self.pin_auth {
            map.serialize_entry(&0x04, &PIN_PROTOCOL)?;
            map.serialize_entry(&0x05, pin_auth)?;
        }
        if let Some(get_modality) = self.get_modality {
            map.serialize_entry(&0x06, &get_modality)?;
        }
        map.end()
    }
}

impl RequestCtap2 for BioEnrollmentRequest {
    type Output = BioEnrollmentResponse;

    fn command(&self) -> Command {
        self.version.command()
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        to_vec(&self).map_err(CommandError::Serializing)
    }

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        if body.is_empty() {
            // Cancel, rename and delete answer with a bare OK status.
            return Ok(BioEnrollmentResponse::default());
        }
        from_slice(body).map_err(CommandError::Deserializing)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BioTemplateInfo {
    pub template_id: Vec<u8>,
    pub template_friendly_name: Option<String>,
}

impl<'de> Deserialize<'de> for BioTemplateInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BioTemplateInfoVisitor;

        impl<'de> Visitor<'de> for BioTemplateInfoVisitor {
            type Value = BioTemplateInfo;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut template_id: Option<ByteBuf> = None;
                let mut template_friendly_name = None;
                while let Some(key) = map.next_key()? {
                    match key {
                        0x01 => {
                            if template_id.is_some() {
                                return Err(SerdeError::duplicate_field("template_id"));
                            }
                            template_id = Some(map.next_value()?);
                        }
                        0x02 => {
                            if template_friendly_name.is_some() {
                                return Err(SerdeError::duplicate_field(
                                    "template_friendly_name",
                                ));
                            }
                            template_friendly_name = Some(map.next_value()?);
                        }
                        k => {
                            warn!("BioTemplateInfo: ignoring unknown key {}", k);
                            let _ = map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                match template_id {
                    Some(template_id) => Ok(BioTemplateInfo {
                        template_id: template_id.into_vec(),
                        template_friendly_name,
                    }),
                    None => Err(SerdeError::missing_field("template_id")),
                }
            }
        }

        deserializer.deserialize_bytes(BioTemplateInfoVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BioEnrollmentResponse {
    pub modality: Option<BioEnrollmentModality>,
    pub fingerprint_kind: Option<FingerprintKind>,
    pub max_capture_samples_required_for_enroll: Option<u64>,
    pub template_id: Option<Vec<u8>>,
    pub last_enroll_sample_status: Option<BioEnrollmentSampleStatus>,
    pub remaining_samples: Option<u64>,
    pub template_infos: Vec<BioTemplateInfo>,
}

impl<'de> Deserialize<'de> for BioEnrollmentResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BioEnrollmentResponseVisitor;

        impl<'de> Visitor<'de> for BioEnrollmentResponseVisitor {
            type Value = BioEnrollmentResponse;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut response = BioEnrollmentResponse::default();
                let mut template_id: Option<ByteBuf> = None;
                let mut template_infos: Option<Vec<BioTemplateInfo>> = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        0x01 => {
                            if response.modality.is_some() {
                                return Err(SerdeError::duplicate_field("modality"));
                            }
                            response.modality = Some(map.next_value()?);
                        }
                        0x02 => {
                            if response.fingerprint_kind.is_some() {
                                return Err(SerdeError::duplicate_field("fingerprint_kind"));
                            }
                            response.fingerprint_kind = Some(map.next_value()?);
                        }
                        0x03 => {
                            if response.max_capture_samples_required_for_enroll.is_some() {
                                return Err(SerdeError::duplicate_field(
                                    "max_capture_samples_required_for_enroll",
                                ));
                            }
                            response.max_capture_samples_required_for_enroll =
                                Some(map.next_value()?);
                        }
                        0x04 => {
                            if template_id.is_some() {
                                return Err(SerdeError::duplicate_field("template_id"));
                            }
                            template_id = Some(map.next_value()?);
                        }
                        0x05 => {
                            if response.last_enroll_sample_status.is_some() {
                                return Err(SerdeError::duplicate_field(
                                    "last_enroll_sample_status",
                                ));
                            }
                            response.last_enroll_sample_status = Some(map.next_value()?);
                        }
                        0x06 => {
                            if response.remaining_samples.is_some() {
                                return Err(SerdeError::duplicate_field("remaining_samples"));
                            }
                            response.remaining_samples = Some(map.next_value()?);
                        }
                        0x07 => {
                            if template_infos.is_some() {
                                return Err(SerdeError::duplicate_field("template_infos"));
                            }
                            template_infos = Some(map.next_value()?);
                        }
                        k => {
                            warn!("BioEnrollmentResponse: ignoring unknown key {}", k);
                            let _ = map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                response.template_id = template_id.map(ByteBuf::into_vec);
                response.template_infos = template_infos.unwrap_or_default();
                Ok(response)
            }
        }

        deserializer.deserialize_bytes(BioEnrollmentResponseVisitor)
    }
}
