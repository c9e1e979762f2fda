/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::{Command, CommandError, RequestCtap2};
use serde::{
    de::{Error as SError, IgnoredAny, MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};
use serde_cbor::de::from_slice;
use std::fmt;

#[derive(Serialize, PartialEq, Eq, Clone)]
pub struct AAGuid(pub [u8; 16]);

impl AAGuid {
    pub fn from(src: &[u8]) -> Result<AAGuid, ()> {
        let mut payload = [0u8; 16];
        if src.len() != payload.len() {
            Err(())
        } else {
            payload.copy_from_slice(src);
            Ok(AAGuid(payload))
        }
    }

    pub fn empty() -> Self {
        AAGuid([0u8; 16])
    }
}

impl fmt::Debug for AAGuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "AAGuid({:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x})",
            self.0[0],
            self.0[1],
            self.0[2],
            self.0[3],
            self.0[4],
            self.0[5],
            self.0[6],
            self.0[7],
            self.0[8],
            self.0[9],
            self.0[10],
            self.0[11],
            self.0[12],
            self.0[13],
            self.0[14],
            self.0[15]
        )
    }
}

impl<'de> Deserialize<'de> for AAGuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AAGuidVisitor;

        impl<'de> Visitor<'de> for AAGuidVisitor {
            type Value = AAGuid;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte array")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: SError,
            {
                AAGuid::from(v).map_err(|_| E::custom("expecting 16 bytes data"))
            }
        }

        deserializer.deserialize_bytes(AAGuidVisitor)
    }
}

/// Whether the device can take a client PIN, and whether one is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPinAvailability {
    NotSupported,
    SupportedButPinNotSet,
    SupportedAndPinSet,
}

/// Whether the device can verify the user by itself (biometrics, built-in
/// UI), and whether that has been configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserVerificationAvailability {
    NotSupported,
    SupportedButNotConfigured,
    SupportedAndConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioEnrollmentAvailability {
    NotSupported,
    SupportedButUnconfigured,
    SupportedAndConfigured,
}

fn bio_availability(opt: Option<bool>) -> BioEnrollmentAvailability {
    match opt {
        Some(true) => BioEnrollmentAvailability::SupportedAndConfigured,
        Some(false) => BioEnrollmentAvailability::SupportedButUnconfigured,
        None => BioEnrollmentAvailability::NotSupported,
    }
}

/// The option map from authenticatorGetInfo, kept in wire form. Tri-state
/// semantics per the CTAP2 spec: absent means unsupported, `false` means
/// supported but not set up, `true` means ready.
#[derive(Debug, Deserialize, Clone, Eq, PartialEq)]
pub struct AuthenticatorOptions {
    /// The device is attached to the client and cannot be removed and used
    /// on another one.
    #[serde(rename = "plat", default)]
    pub(crate) platform_device: bool,
    /// The device can store resident keys and answer GetAssertion with an
    /// empty allow list.
    #[serde(rename = "rk", default)]
    pub(crate) resident_key: bool,
    #[serde(rename = "clientPin", default)]
    pub(crate) client_pin: Option<bool>,
    /// The device is capable of testing user presence.
    #[serde(rename = "up", default = "default_true")]
    pub(crate) user_presence: bool,
    #[serde(rename = "uv", default)]
    pub(crate) user_verification: Option<bool>,
    #[serde(rename = "credMgmt", default)]
    pub(crate) credential_management: Option<bool>,
    #[serde(rename = "credentialMgmtPreview", default)]
    pub(crate) credential_management_preview: Option<bool>,
    #[serde(rename = "bioEnroll", default)]
    pub(crate) bio_enrollment: Option<bool>,
    #[serde(rename = "userVerificationMgmtPreview", default)]
    pub(crate) bio_enrollment_preview: Option<bool>,
}

fn default_true() -> bool {
    true
}

impl Default for AuthenticatorOptions {
    fn default() -> Self {
        AuthenticatorOptions {
            platform_device: false,
            resident_key: false,
            client_pin: None,
            user_presence: true,
            user_verification: None,
            credential_management: None,
            credential_management_preview: None,
            bio_enrollment: None,
            bio_enrollment_preview: None,
        }
    }
}

impl AuthenticatorOptions {
    pub fn client_pin_availability(&self) -> ClientPinAvailability {
        match self.client_pin {
            Some(true) => ClientPinAvailability::SupportedAndPinSet,
            Some(false) => ClientPinAvailability::SupportedButPinNotSet,
            None => ClientPinAvailability::NotSupported,
        }
    }

    pub fn user_verification_availability(&self) -> UserVerificationAvailability {
        match self.user_verification {
            Some(true) => UserVerificationAvailability::SupportedAndConfigured,
            Some(false) => UserVerificationAvailability::SupportedButNotConfigured,
            None => UserVerificationAvailability::NotSupported,
        }
    }

    pub fn supports_credential_management(&self) -> bool {
        self.credential_management == Some(true)
    }

    pub fn supports_credential_management_preview(&self) -> bool {
        self.credential_management_preview == Some(true)
    }

    pub fn bio_enrollment_availability(&self) -> BioEnrollmentAvailability {
        bio_availability(self.bio_enrollment)
    }

    pub fn bio_enrollment_preview_availability(&self) -> BioEnrollmentAvailability {
        bio_availability(self.bio_enrollment_preview)
    }
}

#[derive(Debug, Default)]
pub struct GetInfo {}

impl RequestCtap2 for GetInfo {
    type Output = AuthenticatorInfo;

    fn command(&self) -> Command {
        Command::GetInfo
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        Ok(Vec::new())
    }

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        if body.is_empty() {
            return Err(CommandError::InputTooSmall);
        }
        trace!("parsing authenticator info data: {:#04X?}", body);
        from_slice(body).map_err(CommandError::Deserializing)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AuthenticatorInfo {
    pub(crate) versions: Vec<String>,
    pub(crate) extensions: Vec<String>,
    pub(crate) aaguid: AAGuid,
    pub(crate) options: AuthenticatorOptions,
    pub(crate) max_msg_size: Option<usize>,
    pub(crate) pin_protocols: Vec<u64>,
}

impl AuthenticatorInfo {
    pub fn supports_u2f(&self) -> bool {
        self.versions.iter().any(|v| v == "U2F_V2")
    }

    pub fn supports_ctap2(&self) -> bool {
        self.versions.iter().any(|v| v == "FIDO_2_0" || v == "FIDO_2_1")
    }

    pub fn options(&self) -> &AuthenticatorOptions {
        &self.options
    }
}

impl<'de> Deserialize<'de> for AuthenticatorInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AuthenticatorInfoVisitor;

        impl<'de> Visitor<'de> for AuthenticatorInfoVisitor {
            type Value = AuthenticatorInfo;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut versions = Vec::new();
                let mut extensions = Vec::new();
                let mut aaguid = None;
                let mut options = AuthenticatorOptions::default();
                let mut max_msg_size = None;
                let mut pin_protocols = Vec::new();

                while let Some(key) = map.next_key()? {
                    match key {
                        1 => {
                            if !versions.is_empty() {
                                return Err(SError::duplicate_field("versions"));
                            }
                            versions = map.next_value()?;
                        }
                        2 => {
                            if !extensions.is_empty() {
                                return Err(SError::duplicate_field("extensions"));
                            }
                            extensions = map.next_value()?;
                        }
                        3 => {
                            if aaguid.is_some() {
                                return Err(SError::duplicate_field("aaguid"));
                            }
                            aaguid = Some(map.next_value()?);
                        }
                        4 => {
                            options = map.next_value()?;
                        }
                        5 => {
                            max_msg_size = Some(map.next_value()?);
                        }
                        6 => {
                            pin_protocols = map.next_value()?;
                        }
                        k => {
                            // CTAP2.1 devices report plenty more; none of it
                            // is load-bearing here.
                            warn!("AuthenticatorInfo: ignoring unknown key {}", k);
                            let _ = map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                if versions.is_empty() {
                    return Err(M::Error::custom(
                        "expected at least one version, got none".to_string(),
                    ));
                }

                if let Some(aaguid) = aaguid {
                    Ok(AuthenticatorInfo {
                        versions,
                        extensions,
                        aaguid,
                        options,
                        max_msg_size,
                        pin_protocols,
                    })
                } else {
                    Err(M::Error::custom("No AAGuid specified".to_string()))
                }
            }
        }

        deserializer.deserialize_bytes(AuthenticatorInfoVisitor)
    }
}
