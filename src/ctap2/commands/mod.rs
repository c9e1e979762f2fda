/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::crypto::CryptoError;
use crate::ctap2::commands::client_pin::PinError;
use serde_cbor::{error::Error as CborError, Value};
use std::convert::TryFrom;
use std::error::Error as StdErrorT;
use std::fmt;

pub(crate) mod bio_enrollment;
pub(crate) mod client_pin;
pub(crate) mod credential_management;
pub(crate) mod get_assertion;
pub(crate) mod get_info;
pub(crate) mod get_next_assertion;
pub(crate) mod make_credentials;
pub(crate) mod reset;

// Spec: https://fidoalliance.org/specs/fido-v2.0-ps-20190130/fido-client-to-authenticator-protocol-v2.0-ps-20190130.html#authenticator-api
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    MakeCredentials = 0x01,
    GetAssertion = 0x02,
    GetInfo = 0x04,
    ClientPin = 0x06,
    Reset = 0x07,
    GetNextAssertion = 0x08,
    BioEnrollment = 0x09,
    CredentialManagement = 0x0A,
    BioEnrollmentPreview = 0x40,
    CredentialManagementPreview = 0x41,
}

/// A single CTAP2 exchange: `wire_format` yields the CBOR parameter map
/// (empty for parameterless commands), `parse_response` consumes the CBOR
/// body that followed an OK status byte. Both directions are pure; the
/// operation runner owns framing, status-byte splitting and delivery.
pub(crate) trait RequestCtap2: fmt::Debug {
    type Output;

    fn command(&self) -> Command;

    fn wire_format(&self) -> Result<Vec<u8>, CommandError>;

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Indicates successful response.
    OK,
    /// The command is not a valid CTAP command.
    InvalidCommand,
    /// The command included an invalid parameter.
    InvalidParameter,
    /// Invalid message or item length.
    InvalidLength,
    /// Invalid message sequencing.
    InvalidSeq,
    /// Message timed out.
    Timeout,
    /// Channel busy.
    ChannelBusy,
    /// Command requires channel lock.
    LockRequired,
    /// Command not allowed on this cid.
    InvalidChannel,
    /// Invalid/unexpected CBOR error.
    CBORUnexpectedType,
    /// Error when parsing CBOR.
    InvalidCBOR,
    /// Missing non-optional parameter.
    MissingParameter,
    /// Limit for number of items exceeded.
    LimitExceeded,
    /// Unsupported extension.
    UnsupportedExtension,
    /// Valid credential found in the exclude list.
    CredentialExcluded,
    /// Processing (Lengthy operation is in progress).
    Processing,
    /// Credential not valid for the authenticator.
    InvalidCredential,
    /// Authentication is waiting for user interaction.
    UserActionPending,
    /// Processing, lengthy operation is in progress.
    OperationPending,
    /// No request is pending.
    NoOperations,
    /// Authenticator does not support requested algorithm.
    UnsupportedAlgorithm,
    /// Not authorized for requested operation.
    OperationDenied,
    /// Internal key storage is full.
    KeyStoreFull,
    /// No outstanding operations.
    NoOperationPending,
    /// Unsupported option.
    UnsupportedOption,
    /// Not a valid option for current operation.
    InvalidOption,
    /// Pending keep alive was cancelled.
    KeepaliveCancel,
    /// No valid credentials provided.
    NoCredentials,
    /// Timeout waiting for user interaction.
    UserActionTimeout,
    /// Continuation command, such as, authenticatorGetNextAssertion not
    /// allowed.
    NotAllowed,
    /// PIN Invalid.
    PinInvalid,
    /// PIN Blocked.
    PinBlocked,
    /// PIN authentication,pinAuth, verification failed.
    PinAuthInvalid,
    /// PIN authentication,pinAuth, blocked. Requires power recycle to reset.
    PinAuthBlocked,
    /// No PIN has been set.
    PinNotSet,
    /// PIN is required for the selected operation.
    PinRequired,
    /// PIN policy violation. Currently only enforces minimum length.
    PinPolicyViolation,
    /// pinToken expired on authenticator.
    PinTokenExpired,
    /// Authenticator cannot handle this request due to memory constraints.
    RequestTooLarge,
    /// The current operation has timed out.
    ActionTimeout,
    /// User presence is required for the requested operation.
    UpRequired,
    /// Catch-all code the authenticator reports when nothing more specific
    /// applies.
    Other,

    /// Unassigned wire code.
    Unknown(u8),

    /// Local-only: the transport failed before the authenticator answered.
    /// Deliberately has no wire value.
    DeviceError,
}

impl StatusCode {
    pub fn is_ok(&self) -> bool {
        matches!(*self, StatusCode::OK)
    }
}

impl From<u8> for StatusCode {
    fn from(value: u8) -> StatusCode {
        match value {
            0x00 => StatusCode::OK,
            0x01 => StatusCode::InvalidCommand,
            0x02 => StatusCode::InvalidParameter,
            0x03 => StatusCode::InvalidLength,
            0x04 => StatusCode::InvalidSeq,
            0x05 => StatusCode::Timeout,
            0x06 => StatusCode::ChannelBusy,
            0x0A => StatusCode::LockRequired,
            0x0B => StatusCode::InvalidChannel,
            0x11 => StatusCode::CBORUnexpectedType,
            0x12 => StatusCode::InvalidCBOR,
            0x14 => StatusCode::MissingParameter,
            0x15 => StatusCode::LimitExceeded,
            0x16 => StatusCode::UnsupportedExtension,
            0x19 => StatusCode::CredentialExcluded,
            0x21 => StatusCode::Processing,
            0x22 => StatusCode::InvalidCredential,
            0x23 => StatusCode::UserActionPending,
            0x24 => StatusCode::OperationPending,
            0x25 => StatusCode::NoOperations,
            0x26 => StatusCode::UnsupportedAlgorithm,
            0x27 => StatusCode::OperationDenied,
            0x28 => StatusCode::KeyStoreFull,
            0x2A => StatusCode::NoOperationPending,
            0x2B => StatusCode::UnsupportedOption,
            0x2C => StatusCode::InvalidOption,
            0x2D => StatusCode::KeepaliveCancel,
            0x2E => StatusCode::NoCredentials,
            0x2F => StatusCode::UserActionTimeout,
            0x30 => StatusCode::NotAllowed,
            0x31 => StatusCode::PinInvalid,
            0x32 => StatusCode::PinBlocked,
            0x33 => StatusCode::PinAuthInvalid,
            0x34 => StatusCode::PinAuthBlocked,
            0x35 => StatusCode::PinNotSet,
            0x36 => StatusCode::PinRequired,
            0x37 => StatusCode::PinPolicyViolation,
            0x38 => StatusCode::PinTokenExpired,
            0x39 => StatusCode::RequestTooLarge,
            0x3A => StatusCode::ActionTimeout,
            0x3B => StatusCode::UpRequired,
            0x7F => StatusCode::Other,

            othr => StatusCode::Unknown(othr),
        }
    }
}

#[cfg(test)]
impl From<StatusCode> for u8 {
    fn from(status: StatusCode) -> u8 {
        match status {
            StatusCode::OK => 0x00,
            StatusCode::InvalidCommand => 0x01,
            StatusCode::InvalidParameter => 0x02,
            StatusCode::InvalidLength => 0x03,
            StatusCode::InvalidSeq => 0x04,
            StatusCode::Timeout => 0x05,
            StatusCode::ChannelBusy => 0x06,
            StatusCode::LockRequired => 0x0A,
            StatusCode::InvalidChannel => 0x0B,
            StatusCode::CBORUnexpectedType => 0x11,
            StatusCode::InvalidCBOR => 0x12,
            StatusCode::MissingParameter => 0x14,
            StatusCode::LimitExceeded => 0x15,
            StatusCode::UnsupportedExtension => 0x16,
            StatusCode::CredentialExcluded => 0x19,
            StatusCode::Processing => 0x21,
            StatusCode::InvalidCredential => 0x22,
            StatusCode::UserActionPending => 0x23,
            StatusCode::OperationPending => 0x24,
            StatusCode::NoOperations => 0x25,
            StatusCode::UnsupportedAlgorithm => 0x26,
            StatusCode::OperationDenied => 0x27,
            StatusCode::KeyStoreFull => 0x28,
            StatusCode::NoOperationPending => 0x2A,
            StatusCode::UnsupportedOption => 0x2B,
            StatusCode::InvalidOption => 0x2C,
            StatusCode::KeepaliveCancel => 0x2D,
            StatusCode::NoCredentials => 0x2E,
            StatusCode::UserActionTimeout => 0x2F,
            StatusCode::NotAllowed => 0x30,
            StatusCode::PinInvalid => 0x31,
            StatusCode::PinBlocked => 0x32,
            StatusCode::PinAuthInvalid => 0x33,
            StatusCode::PinAuthBlocked => 0x34,
            StatusCode::PinNotSet => 0x35,
            StatusCode::PinRequired => 0x36,
            StatusCode::PinPolicyViolation => 0x37,
            StatusCode::PinTokenExpired => 0x38,
            StatusCode::RequestTooLarge => 0x39,
            StatusCode::ActionTimeout => 0x3A,
            StatusCode::UpRequired => 0x3B,
            StatusCode::Other => 0x7F,

            StatusCode::Unknown(othr) => othr,
            StatusCode::DeviceError => panic!("DeviceError has no wire value"),
        }
    }
}

#[derive(Debug)]
pub enum CommandError {
    InputTooSmall,
    MissingRequiredField(&'static str),
    UnexpectedField(&'static str),
    Deserializing(CborError),
    Serializing(CborError),
    StatusCode(StatusCode, Option<Value>),
    Crypto(CryptoError),
    UnsupportedPinProtocol,
    Pin(PinError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CommandError::InputTooSmall => write!(f, "CommandError: Input is too small"),
            CommandError::MissingRequiredField(field) => {
                write!(f, "CommandError: Missing required field {}", field)
            }
            CommandError::UnexpectedField(field) => {
                write!(f, "CommandError: Unexpected field {}", field)
            }
            CommandError::Deserializing(ref e) => {
                write!(f, "CommandError: Error while parsing: {}", e)
            }
            CommandError::Serializing(ref e) => {
                write!(f, "CommandError: Error while serializing: {}", e)
            }
            CommandError::StatusCode(ref code, ref value) => {
                write!(f, "CommandError: Unexpected code: {:?} ({:?})", code, value)
            }
            CommandError::Crypto(ref e) => write!(f, "CommandError: Crypto error: {}", e),
            CommandError::UnsupportedPinProtocol => {
                write!(f, "CommandError: Pin protocol is not supported")
            }
            CommandError::Pin(ref p) => write!(f, "CommandError: Pin error: {}", p),
        }
    }
}

impl StdErrorT for CommandError {}

impl From<CryptoError> for CommandError {
    fn from(e: CryptoError) -> Self {
        CommandError::Crypto(e)
    }
}

impl From<PinError> for CommandError {
    fn from(e: PinError) -> Self {
        CommandError::Pin(e)
    }
}

/// Optional pre-parse repair hook for response bodies; see
/// [`repair_invalid_utf8`].
pub(crate) type Utf8FixupFn = fn(&[u8]) -> Option<Vec<u8>>;

/// Rewrite a CBOR item so that every text string holds valid UTF-8, lossily
/// replacing offending bytes. Some hardware keys ship truncated multi-byte
/// characters in user-supplied strings (names of RPs, users and fingerprint
/// templates), which strict decoding would otherwise reject wholesale.
///
/// Returns `None` when the input is not a single well-formed CBOR item, in
/// which case the caller parses the original bytes (and fails there with a
/// better error).
pub(crate) fn repair_invalid_utf8(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let rest = fixup_item(body, &mut out)?;
    if rest.is_empty() {
        Some(out)
    } else {
        None
    }
}

fn read_length(input: &[u8]) -> Option<(u64, &[u8])> {
    let additional = input[0] & 0x1F;
    let (need, rest) = match additional {
        0..=23 => return Some((u64::from(additional), &input[1..])),
        24 => (1, &input[1..]),
        25 => (2, &input[1..]),
        26 => (4, &input[1..]),
        27 => (8, &input[1..]),
        // Indefinite lengths never appear in CTAP2 messages.
        _ => return None,
    };
    if rest.len() < need {
        return None;
    }
    let mut value = 0u64;
    for byte in &rest[..need] {
        value = (value << 8) | u64::from(*byte);
    }
    Some((value, &rest[need..]))
}

fn write_type_and_length(out: &mut Vec<u8>, major: u8, value: u64) {
    let major = major << 5;
    if value < 24 {
        out.push(major | value as u8);
    } else if value <= 0xFF {
        out.push(major | 24);
        out.push(value as u8);
    } else if value <= 0xFFFF {
        out.push(major | 25);
        out.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= 0xFFFF_FFFF {
        out.push(major | 26);
        out.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        out.push(major | 27);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

fn fixup_item<'a>(input: &'a [u8], out: &mut Vec<u8>) -> Option<&'a [u8]> {
    if input.is_empty() {
        return None;
    }
    let major = input[0] >> 5;
    match major {
        // Integers: header only.
        0 | 1 => {
            let (value, rest) = read_length(input)?;
            write_type_and_length(out, major, value);
            Some(rest)
        }
        // Byte strings pass through untouched.
        2 => {
            let (len, rest) = read_length(input)?;
            let len = usize::try_from(len).ok()?;
            if rest.len() < len {
                return None;
            }
            write_type_and_length(out, major, len as u64);
            out.extend_from_slice(&rest[..len]);
            Some(&rest[len..])
        }
        3 => {
            let (len, rest) = read_length(input)?;
            let len = usize::try_from(len).ok()?;
            if rest.len() < len {
                return None;
            }
            let raw = &rest[..len];
            match std::str::from_utf8(raw) {
                Ok(_) => {
                    write_type_and_length(out, major, len as u64);
                    out.extend_from_slice(raw);
                }
                Err(_) => {
                    let repaired = String::from_utf8_lossy(raw);
                    let repaired = repaired.as_bytes();
                    write_type_and_length(out, major, repaired.len() as u64);
                    out.extend_from_slice(repaired);
                }
            }
            Some(&rest[len..])
        }
        4 => {
            let (len, mut rest) = read_length(input)?;
            write_type_and_length(out, major, len);
            for _ in 0..len {
                rest = fixup_item(rest, out)?;
            }
            Some(rest)
        }
        5 => {
            let (len, mut rest) = read_length(input)?;
            write_type_and_length(out, major, len);
            for _ in 0..len.checked_mul(2)? {
                rest = fixup_item(rest, out)?;
            }
            Some(rest)
        }
        6 => {
            let (tag, rest) = read_length(input)?;
            write_type_and_length(out, major, tag);
            fixup_item(rest, out)
        }
        // Simple values and floats: copy the header and its payload.
        _ => {
            let additional = input[0] & 0x1F;
            let payload = match additional {
                0..=23 => 0,
                24 => 1,
                25 => 2,
                26 => 4,
                27 => 8,
                _ => return None,
            };
            if input.len() < 1 + payload {
                return None;
            }
            out.extend_from_slice(&input[..1 + payload]);
            Some(&input[1 + payload..])
        }
    }
}
