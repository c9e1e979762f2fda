/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Protocol driver for FIDO security keys.
//!
//! One [`FidoDeviceAuthenticator`] owns one device channel and turns it into
//! typed CTAP2 operations: MakeCredential and GetAssertion (with transparent
//! U2F fallback on dual-protocol tokens), the client-PIN protocol, resident
//! credential management and fingerprint enrollment.
//!
//! The crate performs no I/O of its own. [`transport::FidoDevice::send`]
//! starts a transfer and the embedder feeds the reply back through
//! [`FidoDeviceAuthenticator::handle_device_response`]; results arrive
//! through per-operation callbacks as `(StatusCode, Option<Response>)`.
//! Requests to one authenticator are strictly serialized: starting an
//! operation while another is outstanding is a bug in the caller and
//! panics.

#[macro_use]
extern crate log;

pub mod apdu;
mod authenticator;
mod crypto;
pub mod ctap2;
mod operation;
mod task;
pub mod transport;

pub use crate::authenticator::{
    BioEnrollmentCallback, CredentialsMetadataCallback, DeleteCredentialCallback,
    EnumerateCredentialsCallback, FidoDeviceAuthenticator, GetAssertionCallback,
    GetAssertionPinDisposition, GetEphemeralKeyCallback, GetPinTokenCallback, GetRetriesCallback,
    GetTouchCallback, InitCallback, MakeCredentialCallback, MakeCredentialPinDisposition,
    Observer, ResetCallback, SetPinCallback,
};
pub use crate::crypto::CryptoError;
pub use crate::ctap2::attestation::{
    AttestationObject, AttestedCredentialData, AuthenticatorData, AuthenticatorDataFlags,
};
pub use crate::ctap2::commands::bio_enrollment::{
    BioEnrollmentModality, BioEnrollmentResponse, BioEnrollmentSampleStatus, BioTemplateInfo,
    FingerprintKind,
};
pub use crate::ctap2::commands::client_pin::{
    EmptyResponse, KeyAgreementResponse, Pin, PinAuth, PinError, RetriesResponse, TokenResponse,
};
pub use crate::ctap2::commands::credential_management::{
    AggregatedEnumerateCredentialsResponse, CredentialsMetadataResponse,
    DeleteCredentialResponse, EnumerateCredentialsResponse, EnumerateRPsResponse,
};
pub use crate::ctap2::commands::get_assertion::{
    GetAssertion, GetAssertionOptions, GetAssertionResponse,
};
pub use crate::ctap2::commands::get_info::{
    AAGuid, AuthenticatorInfo, AuthenticatorOptions, BioEnrollmentAvailability,
    ClientPinAvailability, UserVerificationAvailability,
};
pub use crate::ctap2::commands::make_credentials::{MakeCredentials, MakeCredentialsOptions};
pub use crate::ctap2::commands::reset::ResetResponse;
pub use crate::ctap2::commands::{Command, CommandError, StatusCode};
pub use crate::ctap2::server::{
    ClientDataHash, PublicKeyCredentialDescriptor, PublicKeyCredentialParameters, RelyingParty,
    RpIdHash, User, UserVerificationRequirement,
};
