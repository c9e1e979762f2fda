/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! authenticatorClientPIN: retries query, key agreement, PIN token
//! derivation, and setting/changing the PIN. PIN protocol 1 throughout.

use super::{Command, CommandError, RequestCtap2};
use crate::crypto::{EphemeralKey, SharedSecret};
use serde::{
    de::{Error as SerdeError, IgnoredAny, MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_bytes::ByteBuf;
use serde_cbor::de::from_slice;
use serde_cbor::ser::to_vec;
use sha2::{Digest, Sha256};
use std::error::Error as StdErrorT;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) const PIN_PROTOCOL: u8 = 1;

#[derive(Debug, Copy, Clone)]
#[repr(u8)]
pub enum PINSubcommand {
    GetRetries = 0x01,
    GetKeyAgreement = 0x02,
    SetPIN = 0x03,
    ChangePIN = 0x04,
    GetPINToken = 0x05,
}

/// The raw request map shared by every clientPin subcommand.
#[derive(Debug)]
pub(crate) struct ClientPIN {
    pin_protocol: u8,
    subcommand: PINSubcommand,
    key_agreement: Option<CoseKeyAgreement>,
    pin_auth: Option<PinAuth>,
    new_pin_enc: Option<ByteBuf>,
    pin_hash_enc: Option<ByteBuf>,
}

impl Default for ClientPIN {
    fn default() -> Self {
        ClientPIN {
            pin_protocol: PIN_PROTOCOL,
            subcommand: PINSubcommand::GetRetries,
            key_agreement: None,
            pin_auth: None,
            new_pin_enc: None,
            pin_hash_enc: None,
        }
    }
}

impl Serialize for ClientPIN {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Need to define how many elements are going to be in the map
        // beforehand
        let mut map_len = 2;
        if self.key_agreement.is_some() {
            map_len += 1;
        }
        if self.pin_auth.is_some() {
            map_len += 1;
        }
        if self.new_pin_enc.is_some() {
            map_len += 1;
        }
        if self.pin_hash_enc.is_some() {
            map_len += 1;
        }

        let mut map = serializer.serialize_map(Some(map_len))?;
        map.serialize_entry(&1, &self.pin_protocol)?;
        map.serialize_entry(&2, &(self.subcommand as u8))?;
        if let Some(ref key_agreement) = self.key_agreement {
            map.serialize_entry(&3, key_agreement)?;
        }
        if let Some(ref pin_auth) = self.pin_auth {
            map.serialize_entry(&4, pin_auth)?;
        }
        if let Some(ref new_pin_enc) = self.new_pin_enc {
            map.serialize_entry(&5, new_pin_enc)?;
        }
        if let Some(ref pin_hash_enc) = self.pin_hash_enc {
            map.serialize_entry(&6, pin_hash_enc)?;
        }

        map.end()
    }
}

/// A P-256 point in COSE EC2 form, used in both directions of the key
/// agreement handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoseKeyAgreement {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl Serialize for CoseKeyAgreement {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(5))?;
        map.serialize_entry(&1, &2)?; // kty: EC2
        map.serialize_entry(&3, &-25)?; // alg: ECDH-ES + HKDF-256
        map.serialize_entry(&-1, &1)?; // crv: P-256
        map.serialize_entry(&-2, &ByteBuf::from(self.x.to_vec()))?;
        map.serialize_entry(&-3, &ByteBuf::from(self.y.to_vec()))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for CoseKeyAgreement {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CoseKeyAgreementVisitor;

        impl<'de> Visitor<'de> for CoseKeyAgreementVisitor {
            type Value = CoseKeyAgreement;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut kty: Option<i64> = None;
                let mut alg: Option<i64> = None;
                let mut crv: Option<i64> = None;
                let mut x: Option<ByteBuf> = None;
                let mut y: Option<ByteBuf> = None;

                while let Some(key) = map.next_key::<i64>()? {
                    match key {
                        1 => {
                            if kty.is_some() {
                                return Err(SerdeError::duplicate_field("kty"));
                            }
                            kty = Some(map.next_value()?);
                        }
                        3 => {
                            if alg.is_some() {
                                return Err(SerdeError::duplicate_field("alg"));
                            }
                            alg = Some(map.next_value()?);
                        }
                        -1 => {
                            if crv.is_some() {
                                return Err(SerdeError::duplicate_field("crv"));
                            }
                            crv = Some(map.next_value()?);
                        }
                        -2 => {
                            if x.is_some() {
                                return Err(SerdeError::duplicate_field("x"));
                            }
                            x = Some(map.next_value()?);
                        }
                        -3 => {
                            if y.is_some() {
                                return Err(SerdeError::duplicate_field("y"));
                            }
                            y = Some(map.next_value()?);
                        }
                        k => {
                            trace!("CoseKeyAgreement: ignoring key {}", k);
                            let _ = map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                if kty != Some(2) {
                    return Err(SerdeError::custom("kty must be EC2"));
                }
                if alg != Some(-25) {
                    return Err(SerdeError::custom("alg must be ECDH-ES+HKDF-256"));
                }
                if crv != Some(1) {
                    return Err(SerdeError::custom("crv must be P-256"));
                }
                let x = x.ok_or_else(|| SerdeError::missing_field("x"))?;
                let y = y.ok_or_else(|| SerdeError::missing_field("y"))?;
                if x.len() != 32 || y.len() != 32 {
                    return Err(SerdeError::custom("coordinates must be 32 bytes"));
                }
                let mut out = CoseKeyAgreement {
                    x: [0u8; 32],
                    y: [0u8; 32],
                };
                out.x.copy_from_slice(&x);
                out.y.copy_from_slice(&y);
                Ok(out)
            }
        }

        deserializer.deserialize_bytes(CoseKeyAgreementVisitor)
    }
}

/// The response map shared by every clientPin subcommand.
struct ClientPinResponse {
    key_agreement: Option<CoseKeyAgreement>,
    pin_token: Option<ByteBuf>,
    retries: Option<u8>,
    uv_retries: Option<u8>,
}

impl<'de> Deserialize<'de> for ClientPinResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ClientPinResponseVisitor;

        impl<'de> Visitor<'de> for ClientPinResponseVisitor {
            type Value = ClientPinResponse;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut key_agreement = None;
                let mut pin_token = None;
                let mut retries = None;
                let mut uv_retries = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        1 => {
                            if key_agreement.is_some() {
                                return Err(SerdeError::duplicate_field("key_agreement"));
                            }
                            key_agreement = Some(map.next_value()?);
                        }
                        2 => {
                            if pin_token.is_some() {
                                return Err(SerdeError::duplicate_field("pin_token"));
                            }
                            pin_token = Some(map.next_value()?);
                        }
                        3 => {
                            if retries.is_some() {
                                return Err(SerdeError::duplicate_field("retries"));
                            }
                            retries = Some(map.next_value()?);
                        }
                        5 => {
                            if uv_retries.is_some() {
                                return Err(SerdeError::duplicate_field("uv_retries"));
                            }
                            uv_retries = Some(map.next_value()?);
                        }
                        k => {
                            warn!("ClientPinResponse: ignoring unknown key {}", k);
                            let _ = map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(ClientPinResponse {
                    key_agreement,
                    pin_token,
                    retries,
                    uv_retries,
                })
            }
        }

        deserializer.deserialize_bytes(ClientPinResponseVisitor)
    }
}

/// One clientPin subcommand: how to build the shared request map and how to
/// read its slice of the shared response map.
pub(crate) trait ClientPINSubCommand: fmt::Debug {
    type Output;

    fn as_client_pin(&self) -> Result<ClientPIN, CommandError>;

    fn parse_response_payload(&self, body: &[u8]) -> Result<Self::Output, CommandError>;
}

macro_rules! impl_request_for_pin_subcommand {
    ($request:ty) => {
        impl RequestCtap2 for $request {
            type Output = <$request as ClientPINSubCommand>::Output;

            fn command(&self) -> Command {
                Command::ClientPin
            }

            fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
                let client_pin = self.as_client_pin()?;
                to_vec(&client_pin).map_err(CommandError::Serializing)
            }

            fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
                self.parse_response_payload(body)
            }
        }
    };
}

#[derive(Debug, Default)]
pub struct RetriesRequest {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetriesResponse {
    pub pin_retries: u8,
    pub uv_retries: Option<u8>,
}

impl ClientPINSubCommand for RetriesRequest {
    type Output = RetriesResponse;

    fn as_client_pin(&self) -> Result<ClientPIN, CommandError> {
        Ok(ClientPIN {
            subcommand: PINSubcommand::GetRetries,
            ..ClientPIN::default()
        })
    }

    fn parse_response_payload(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        let response: ClientPinResponse = from_slice(body).map_err(CommandError::Deserializing)?;
        match response.retries {
            Some(pin_retries) => Ok(RetriesResponse {
                pin_retries,
                uv_retries: response.uv_retries,
            }),
            None => Err(CommandError::MissingRequiredField("retries")),
        }
    }
}

impl_request_for_pin_subcommand!(RetriesRequest);

#[derive(Debug, Default)]
pub struct KeyAgreementRequest {}

/// The authenticator's ephemeral public key for this handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAgreementResponse(pub(crate) CoseKeyAgreement);

impl ClientPINSubCommand for KeyAgreementRequest {
    type Output = KeyAgreementResponse;

    fn as_client_pin(&self) -> Result<ClientPIN, CommandError> {
        Ok(ClientPIN {
            subcommand: PINSubcommand::GetKeyAgreement,
            ..ClientPIN::default()
        })
    }

    fn parse_response_payload(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        let response: ClientPinResponse = from_slice(body).map_err(CommandError::Deserializing)?;
        match response.key_agreement {
            Some(key) => Ok(KeyAgreementResponse(key)),
            None => Err(CommandError::MissingRequiredField("key_agreement")),
        }
    }
}

impl_request_for_pin_subcommand!(KeyAgreementRequest);

/// getPINToken: encrypt the PIN hash under the freshly agreed key and get a
/// session token back.
#[derive(Debug)]
pub struct TokenRequest {
    our_key: CoseKeyAgreement,
    shared: SharedSecret,
    pin_hash_enc: Vec<u8>,
}

impl TokenRequest {
    pub fn new(pin: &Pin, peer_key: &KeyAgreementResponse) -> Result<Self, CommandError> {
        let ephemeral = EphemeralKey::generate();
        let shared = ephemeral.shared_secret(&peer_key.0.x, &peer_key.0.y)?;
        let (x, y) = ephemeral.public_coordinates();
        let pin_hash_enc = shared.encrypt(&pin.hash_prefix())?;
        Ok(TokenRequest {
            our_key: CoseKeyAgreement { x, y },
            shared,
            pin_hash_enc,
        })
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TokenResponse(Vec<u8>);

impl TokenResponse {
    /// pinAuth for privileged commands: HMAC-SHA-256 under the token,
    /// truncated to 16 bytes.
    pub fn pin_auth(&self, data: &[u8]) -> PinAuth {
        PinAuth(crate::crypto::authenticate(&self.0, data).to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TokenResponse(redacted)")
    }
}

#[cfg(test)]
impl TokenResponse {
    pub(crate) fn for_tests(bytes: Vec<u8>) -> Self {
        TokenResponse(bytes)
    }
}

impl ClientPINSubCommand for TokenRequest {
    type Output = TokenResponse;

    fn as_client_pin(&self) -> Result<ClientPIN, CommandError> {
        Ok(ClientPIN {
            subcommand: PINSubcommand::GetPINToken,
            key_agreement: Some(self.our_key.clone()),
            pin_hash_enc: Some(ByteBuf::from(self.pin_hash_enc.clone())),
            ..ClientPIN::default()
        })
    }

    fn parse_response_payload(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        let response: ClientPinResponse = from_slice(body).map_err(CommandError::Deserializing)?;
        let encrypted = response
            .pin_token
            .ok_or(CommandError::MissingRequiredField("pin_token"))?;
        let token = self.shared.decrypt(&encrypted)?;
        Ok(TokenResponse(token))
    }
}

impl_request_for_pin_subcommand!(TokenRequest);

/// setPIN: only valid while no PIN is set.
#[derive(Debug)]
pub struct SetRequest {
    our_key: CoseKeyAgreement,
    new_pin_enc: Vec<u8>,
    pin_auth: PinAuth,
}

impl SetRequest {
    pub fn new(pin: &Pin, peer_key: &KeyAgreementResponse) -> Result<Self, CommandError> {
        let ephemeral = EphemeralKey::generate();
        let shared = ephemeral.shared_secret(&peer_key.0.x, &peer_key.0.y)?;
        let (x, y) = ephemeral.public_coordinates();
        let new_pin_enc = shared.encrypt(&pin.padded())?;
        let pin_auth = PinAuth(shared.authenticate(&new_pin_enc).to_vec());
        Ok(SetRequest {
            our_key: CoseKeyAgreement { x, y },
            new_pin_enc,
            pin_auth,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyResponse {}

fn parse_empty_response(body: &[u8]) -> Result<EmptyResponse, CommandError> {
    if body.is_empty() {
        Ok(EmptyResponse {})
    } else {
        Err(CommandError::UnexpectedField("non-empty response body"))
    }
}

impl ClientPINSubCommand for SetRequest {
    type Output = EmptyResponse;

    fn as_client_pin(&self) -> Result<ClientPIN, CommandError> {
        Ok(ClientPIN {
            subcommand: PINSubcommand::SetPIN,
            key_agreement: Some(self.our_key.clone()),
            pin_auth: Some(self.pin_auth.clone()),
            new_pin_enc: Some(ByteBuf::from(self.new_pin_enc.clone())),
            ..ClientPIN::default()
        })
    }

    fn parse_response_payload(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        parse_empty_response(body)
    }
}

impl_request_for_pin_subcommand!(SetRequest);

/// changePIN: proves knowledge of the old PIN while installing the new one.
#[derive(Debug)]
pub struct ChangeRequest {
    our_key: CoseKeyAgreement,
    pin_hash_enc: Vec<u8>,
    new_pin_enc: Vec<u8>,
    pin_auth: PinAuth,
}

impl ChangeRequest {
    pub fn new(
        old_pin: &Pin,
        new_pin: &Pin,
        peer_key: &KeyAgreementResponse,
    ) -> Result<Self, CommandError> {
        let ephemeral = EphemeralKey::generate();
        let shared = ephemeral.shared_secret(&peer_key.0.x, &peer_key.0.y)?;
        let (x, y) = ephemeral.public_coordinates();
        let pin_hash_enc = shared.encrypt(&old_pin.hash_prefix())?;
        let new_pin_enc = shared.encrypt(&new_pin.padded())?;
        let mut mac_input = new_pin_enc.clone();
        mac_input.extend_from_slice(&pin_hash_enc);
        let pin_auth = PinAuth(shared.authenticate(&mac_input).to_vec());
        Ok(ChangeRequest {
            our_key: CoseKeyAgreement { x, y },
            pin_hash_enc,
            new_pin_enc,
            pin_auth,
        })
    }
}

impl ClientPINSubCommand for ChangeRequest {
    type Output = EmptyResponse;

    fn as_client_pin(&self) -> Result<ClientPIN, CommandError> {
        Ok(ClientPIN {
            subcommand: PINSubcommand::ChangePIN,
            key_agreement: Some(self.our_key.clone()),
            pin_auth: Some(self.pin_auth.clone()),
            new_pin_enc: Some(ByteBuf::from(self.new_pin_enc.clone())),
            pin_hash_enc: Some(ByteBuf::from(self.pin_hash_enc.clone())),
            ..ClientPIN::default()
        })
    }

    fn parse_response_payload(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        parse_empty_response(body)
    }
}

impl_request_for_pin_subcommand!(ChangeRequest);

/// A pinAuth/pinUvAuthParam value. Zero-length is legal on the wire and is
/// used by the touch-probe request to provoke an immediate PIN error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinAuth(Vec<u8>);

impl PinAuth {
    pub fn empty() -> Self {
        PinAuth(Vec::new())
    }
}

impl From<[u8; 16]> for PinAuth {
    fn from(raw: [u8; 16]) -> Self {
        PinAuth(raw.to_vec())
    }
}

impl AsRef<[u8]> for PinAuth {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for PinAuth {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(&self.0[..], serializer)
    }
}

pub struct Pin(String);

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pin(redacted)")
    }
}

impl Pin {
    /// CTAP2 PIN policy: at least 4 code points, at most 63 bytes of UTF-8.
    pub fn new(value: &str) -> Result<Pin, PinError> {
        if value.chars().count() < 4 {
            return Err(PinError::PinIsTooShort);
        }
        if value.len() > 63 {
            return Err(PinError::PinIsTooLong(value.len()));
        }
        Ok(Pin(String::from(value)))
    }

    /// Left half of SHA-256 of the PIN, the value proven in getPINToken and
    /// changePIN.
    pub(crate) fn hash_prefix(&self) -> [u8; 16] {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_slice()[..16]);
        out
    }

    /// The PIN zero-padded to 64 bytes for newPinEnc.
    pub(crate) fn padded(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PinError {
    PinIsTooShort,
    PinIsTooLong(usize),
}

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PinError::PinIsTooShort => write!(f, "PinError: pin is too short"),
            PinError::PinIsTooLong(len) => write!(f, "PinError: pin is too long ({})", len),
        }
    }
}

impl StdErrorT for PinError {}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::ctap2::commands::StatusCode;

    pub fn device_key_pair() -> (EphemeralKey, KeyAgreementResponse) {
        let device = EphemeralKey::generate();
        let (x, y) = device.public_coordinates();
        (device, KeyAgreementResponse(CoseKeyAgreement { x, y }))
    }

    /// CBOR body of a getKeyAgreement response for the given point.
    pub fn key_agreement_body(x: &[u8; 32], y: &[u8; 32]) -> Vec<u8> {
        let mut body = vec![0xA1, 0x01]; // {1: ...
        body.extend_from_slice(&[0xA5, 0x01, 0x02, 0x03, 0x38, 0x18, 0x20, 0x01]);
        body.extend_from_slice(&[0x21, 0x58, 0x20]);
        body.extend_from_slice(x);
        body.extend_from_slice(&[0x22, 0x58, 0x20]);
        body.extend_from_slice(y);
        body
    }

    #[test]
    fn retries_request_wire_format() {
        let request = RetriesRequest::default();
        assert_eq!(
            request.wire_format().unwrap(),
            vec![0xA2, 0x01, 0x01, 0x02, 0x01]
        );
        assert_eq!(request.command(), Command::ClientPin);
    }

    #[test]
    fn retries_response_parses_counts() {
        // {3: 8}
        let response = RetriesRequest::default()
            .parse_response_payload(&[0xA1, 0x03, 0x08])
            .unwrap();
        assert_eq!(
            response,
            RetriesResponse {
                pin_retries: 8,
                uv_retries: None
            }
        );
        // {3: 5, 5: 3}
        let response = RetriesRequest::default()
            .parse_response_payload(&[0xA2, 0x03, 0x05, 0x05, 0x03])
            .unwrap();
        assert_eq!(response.uv_retries, Some(3));
    }

    #[test]
    fn retries_response_requires_count() {
        // {2: h''} -- wrong field entirely.
        let err = RetriesRequest::default().parse_response_payload(&[0xA1, 0x02, 0x40]);
        assert!(err.is_err());
    }

    #[test]
    fn key_agreement_round_trip() {
        let (_, peer) = device_key_pair();
        let body = key_agreement_body(&peer.0.x, &peer.0.y);
        let parsed = KeyAgreementRequest::default()
            .parse_response_payload(&body)
            .unwrap();
        assert_eq!(parsed, peer);
    }

    #[test]
    fn key_agreement_rejects_wrong_curve() {
        let (_, peer) = device_key_pair();
        let mut body = key_agreement_body(&peer.0.x, &peer.0.y);
        body[9] = 0x02; // crv: 2
        assert!(KeyAgreementRequest::default()
            .parse_response_payload(&body)
            .is_err());
    }

    #[test]
    fn token_round_trip_against_device_side() {
        let (device, peer) = device_key_pair();
        let pin = Pin::new("1234").unwrap();
        let request = TokenRequest::new(&pin, &peer).unwrap();

        // Authenticator side: derive the same secret from the platform key
        // embedded in the request and answer with an encrypted token.
        let client_pin = request.as_client_pin().unwrap();
        let platform_key = client_pin.key_agreement.clone().unwrap();
        let device_shared = device
            .shared_secret(&platform_key.x, &platform_key.y)
            .unwrap();
        assert_eq!(
            device_shared
                .decrypt(client_pin.pin_hash_enc.as_ref().unwrap())
                .unwrap(),
            pin.hash_prefix().to_vec()
        );

        let token = [0x5Au8; 32];
        let token_enc = device_shared.encrypt(&token).unwrap();
        let mut body = vec![0xA1, 0x02, 0x58, 0x20]; // {2: h'...'}
        body.extend_from_slice(&token_enc);

        let parsed = request.parse_response_payload(&body).unwrap();
        assert_eq!(parsed.as_bytes(), &token[..]);

        let auth = parsed.pin_auth(&[0u8; 32]);
        assert_eq!(auth.as_ref().len(), 16);
    }

    #[test]
    fn set_request_encrypts_padded_pin() {
        let (device, peer) = device_key_pair();
        let pin = Pin::new("9876").unwrap();
        let request = SetRequest::new(&pin, &peer).unwrap();
        let client_pin = request.as_client_pin().unwrap();

        let platform_key = client_pin.key_agreement.clone().unwrap();
        let device_shared = device
            .shared_secret(&platform_key.x, &platform_key.y)
            .unwrap();
        let new_pin_enc = client_pin.new_pin_enc.clone().unwrap();
        let decrypted = device_shared.decrypt(&new_pin_enc).unwrap();
        assert_eq!(decrypted.len(), 64);
        assert_eq!(&decrypted[..4], b"9876");
        assert!(decrypted[4..].iter().all(|&b| b == 0));

        let expected_auth = device_shared.authenticate(&new_pin_enc);
        assert_eq!(client_pin.pin_auth.unwrap().as_ref(), &expected_auth[..]);
        assert!(client_pin.pin_hash_enc.is_none());
    }

    #[test]
    fn change_request_proves_old_pin() {
        let (device, peer) = device_key_pair();
        let old_pin = Pin::new("1234").unwrap();
        let new_pin = Pin::new("567890").unwrap();
        let request = ChangeRequest::new(&old_pin, &new_pin, &peer).unwrap();
        let client_pin = request.as_client_pin().unwrap();

        let platform_key = client_pin.key_agreement.clone().unwrap();
        let device_shared = device
            .shared_secret(&platform_key.x, &platform_key.y)
            .unwrap();

        let pin_hash_enc = client_pin.pin_hash_enc.clone().unwrap();
        assert_eq!(
            device_shared.decrypt(&pin_hash_enc).unwrap(),
            old_pin.hash_prefix().to_vec()
        );

        let new_pin_enc = client_pin.new_pin_enc.clone().unwrap();
        let mut mac_input = new_pin_enc.to_vec();
        mac_input.extend_from_slice(&pin_hash_enc);
        let expected_auth = device_shared.authenticate(&mac_input);
        assert_eq!(client_pin.pin_auth.unwrap().as_ref(), &expected_auth[..]);
    }

    #[test]
    fn empty_response_rejects_payload() {
        let (_, peer) = device_key_pair();
        let pin = Pin::new("1234").unwrap();
        let request = SetRequest::new(&pin, &peer).unwrap();
        assert!(request.parse_response_payload(&[]).is_ok());
        assert!(request.parse_response_payload(&[0xA0]).is_err());
    }

    #[test]
    fn pin_policy() {
        assert_eq!(Pin::new("123").unwrap_err(), PinError::PinIsTooShort);
        let too_long = "x".repeat(64);
        assert_eq!(Pin::new(&too_long).unwrap_err(), PinError::PinIsTooLong(64));
        assert!(Pin::new("1234").is_ok());
        // Four multi-byte code points are fine.
        assert!(Pin::new("õçąö").is_ok());
    }

    #[test]
    fn status_code_helper() {
        assert!(StatusCode::OK.is_ok());
        assert!(!StatusCode::PinInvalid.is_ok());
    }
}
