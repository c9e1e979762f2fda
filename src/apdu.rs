/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! U2F (CTAP1) message encoding: extended-length APDU framing and the
//! register/sign response payloads, used when a dual-protocol device falls
//! back from CTAP2.

use crate::ctap2::commands::CommandError;
use nom::bytes::complete::take;
use nom::number::complete::{be_u32, be_u8};
use nom::IResult;

pub const U2F_REGISTER: u8 = 0x01;
pub const U2F_AUTHENTICATE: u8 = 0x02;
pub const U2F_VERSION: u8 = 0x03;

pub const U2F_REQUEST_USER_PRESENCE: u8 = 0x03;
pub const U2F_CHECK_IS_REGISTERED: u8 = 0x07;
pub const U2F_DONT_ENFORCE_USER_PRESENCE_AND_SIGN: u8 = 0x08;

pub const SW_NO_ERROR: [u8; 2] = [0x90, 0x00];
pub const SW_CONDITIONS_NOT_SATISFIED: [u8; 2] = [0x69, 0x85];
pub const SW_WRONG_DATA: [u8; 2] = [0x6A, 0x80];
pub const SW_WRONG_LENGTH: [u8; 2] = [0x67, 0x00];
pub const SW_INS_NOT_SUPPORTED: [u8; 2] = [0x6D, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApduErrorStatus {
    ConditionsNotSatisfied,
    WrongData,
    WrongLength,
    InsNotSupported,
    Unknown([u8; 2]),
}

impl ApduErrorStatus {
    pub fn from_status(status: [u8; 2]) -> Result<(), ApduErrorStatus> {
        match status {
            s if s == SW_NO_ERROR => Ok(()),
            s if s == SW_CONDITIONS_NOT_SATISFIED => Err(ApduErrorStatus::ConditionsNotSatisfied),
            s if s == SW_WRONG_DATA => Err(ApduErrorStatus::WrongData),
            s if s == SW_WRONG_LENGTH => Err(ApduErrorStatus::WrongLength),
            s if s == SW_INS_NOT_SUPPORTED => Err(ApduErrorStatus::InsNotSupported),
            other => Err(ApduErrorStatus::Unknown(other)),
        }
    }
}

/// Extended-length APDU: `CLA INS P1 P2 Lc(3) data Le(2)`.
pub fn apdu_frame(ins: u8, p1: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + data.len());
    frame.push(0); // CLA
    frame.push(ins);
    frame.push(p1);
    frame.push(0); // P2
    frame.push(0); // Lc, high byte of the extended form
    frame.push((data.len() >> 8) as u8);
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    frame.extend_from_slice(&[0, 0]); // Le: accept any length
    frame
}

/// Split a raw reply into payload and the trailing status word.
pub fn split_response(input: &[u8]) -> Result<(&[u8], [u8; 2]), CommandError> {
    if input.len() < 2 {
        return Err(CommandError::InputTooSmall);
    }
    let (payload, status) = input.split_at(input.len() - 2);
    Ok((payload, [status[0], status[1]]))
}

/// One DER TLV item, used to find where the attestation certificate ends
/// and the signature begins in a registration message.
fn der_item(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let start = i;
    let (i, _tag) = be_u8(i)?;
    let (i, first) = be_u8(i)?;
    let (i, len) = if first & 0x80 == 0 {
        (i, usize::from(first))
    } else {
        let count = usize::from(first & 0x7F);
        let (mut i, mut len) = (i, 0usize);
        for _ in 0..count {
            let (rest, byte) = be_u8(i)?;
            len = (len << 8) | usize::from(byte);
            i = rest;
        }
        (i, len)
    };
    let (i, _content) = take(len)(i)?;
    let consumed = start.len() - i.len();
    Ok((i, &start[..consumed]))
}

pub struct U2fRegisterData<'a> {
    pub public_key: &'a [u8],
    pub key_handle: &'a [u8],
    pub certificate: &'a [u8],
    pub signature: &'a [u8],
}

/// Registration message layout: `0x05 || pubkey(65) || khLen || kh || cert || sig`.
pub fn parse_register_response(input: &[u8]) -> Result<U2fRegisterData, CommandError> {
    fn inner(i: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
        let (i, _reserved) = nom::bytes::complete::tag(&[0x05][..])(i)?;
        let (i, public_key) = take(65usize)(i)?;
        let (i, key_handle_len) = be_u8(i)?;
        let (i, key_handle) = take(usize::from(key_handle_len))(i)?;
        let (i, certificate) = der_item(i)?;
        Ok((i, (public_key, key_handle, certificate)))
    }

    let (signature, (public_key, key_handle, certificate)) = inner(input).map_err(|e| {
        error!("error while parsing registration: {:?}", e);
        CommandError::InputTooSmall
    })?;
    if signature.is_empty() {
        return Err(CommandError::MissingRequiredField("signature"));
    }
    Ok(U2fRegisterData {
        public_key,
        key_handle,
        certificate,
        signature,
    })
}

pub struct U2fSignData<'a> {
    pub user_presence: u8,
    pub counter: u32,
    pub signature: &'a [u8],
}

/// Authentication message layout: `presence(1) || counter(4) || sig`.
pub fn parse_sign_response(input: &[u8]) -> Result<U2fSignData, CommandError> {
    fn inner(i: &[u8]) -> IResult<&[u8], (u8, u32)> {
        let (i, user_presence) = be_u8(i)?;
        let (i, counter) = be_u32(i)?;
        Ok((i, (user_presence, counter)))
    }

    let (signature, (user_presence, counter)) = inner(input).map_err(|e| {
        error!("error while parsing authentication: {:?}", e);
        CommandError::InputTooSmall
    })?;
    if signature.is_empty() {
        return Err(CommandError::MissingRequiredField("signature"));
    }
    Ok(U2fSignData {
        user_presence,
        counter,
        signature,
    })
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_reference() {
        let data = [0xAA; 129];
        let frame = apdu_frame(U2F_AUTHENTICATE, U2F_REQUEST_USER_PRESENCE, &data);
        assert_eq!(frame.len(), 138);
        assert_eq!(&frame[..7], &[0x00, 0x02, 0x03, 0x00, 0x00, 0x00, 0x81]);
        assert_eq!(&frame[frame.len() - 2..], &[0x00, 0x00]);
    }

    #[test]
    fn status_words() {
        assert!(ApduErrorStatus::from_status(SW_NO_ERROR).is_ok());
        assert_eq!(
            ApduErrorStatus::from_status(SW_CONDITIONS_NOT_SATISFIED),
            Err(ApduErrorStatus::ConditionsNotSatisfied)
        );
        assert_eq!(
            ApduErrorStatus::from_status([0x12, 0x34]),
            Err(ApduErrorStatus::Unknown([0x12, 0x34]))
        );
    }

    #[test]
    fn split_response_extracts_status() {
        let (payload, status) = split_response(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(payload, &[0x01, 0x02]);
        assert_eq!(status, SW_NO_ERROR);
        assert!(split_response(&[0x90]).is_err());
    }

    // Taken from the CTAP2 spec's CTAP1 interoperability example, with a
    // shortened certificate.
    fn sample_registration() -> Vec<u8> {
        let mut msg = vec![0x05];
        msg.extend_from_slice(&[0x04; 65]); // public key
        msg.push(3); // key handle length
        msg.extend_from_slice(&[0x0A, 0x0B, 0x0C]);
        msg.extend_from_slice(&[0x30, 0x02, 0x01, 0x02]); // tiny DER "certificate"
        msg.extend_from_slice(&[0x30, 0x44, 0x02, 0x20]); // signature prefix
        msg.extend_from_slice(&[0x55; 0x20]);
        msg
    }

    #[test]
    fn parses_registration_message() {
        let msg = sample_registration();
        let parsed = parse_register_response(&msg).unwrap();
        assert_eq!(parsed.public_key.len(), 65);
        assert_eq!(parsed.key_handle, &[0x0A, 0x0B, 0x0C]);
        assert_eq!(parsed.certificate, &[0x30, 0x02, 0x01, 0x02]);
        assert_eq!(parsed.signature[..4], [0x30, 0x44, 0x02, 0x20]);
    }

    #[test]
    fn rejects_registration_without_signature() {
        let mut msg = sample_registration();
        msg.truncate(1 + 65 + 1 + 3 + 4);
        assert!(parse_register_response(&msg).is_err());
    }

    #[test]
    fn parses_sign_message() {
        let mut msg = vec![0x01, 0x00, 0x00, 0x00, 0x3B];
        msg.extend_from_slice(&[0x30, 0x44, 0x02, 0x20]);
        msg.extend_from_slice(&[0x77; 0x20]);
        let parsed = parse_sign_response(&msg).unwrap();
        assert_eq!(parsed.user_presence, 0x01);
        assert_eq!(parsed.counter, 0x3B);
        assert_eq!(parsed.signature.len(), 36);
    }
}
