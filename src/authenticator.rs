/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The per-device authenticator: protocol negotiation, capability-aware PIN
//! handling, and the multi-round enumeration and enrollment flows, all over
//! a single exclusively-owned device channel.

use crate::ctap2::attestation::AttestationObject;
use crate::ctap2::commands::bio_enrollment::{
    BioEnrollmentRequest, BioEnrollmentResponse, BioEnrollmentVersion,
};
use crate::ctap2::commands::client_pin::{
    ChangeRequest, EmptyResponse, KeyAgreementRequest, KeyAgreementResponse, Pin, RetriesRequest,
    RetriesResponse, SetRequest, TokenRequest, TokenResponse,
};
use crate::ctap2::commands::credential_management::{
    AggregatedEnumerateCredentialsResponse, CredentialManagementVersion,
    CredentialsMetadataRequest, CredentialsMetadataResponse, DeleteCredentialRequest,
    DeleteCredentialResponse, EnumerateCredentialsRequest, EnumerateCredentialsResponse,
    EnumerateRPsRequest, EnumerateRPsResponse,
};
use crate::ctap2::commands::get_assertion::{GetAssertion, GetAssertionResponse};
use crate::ctap2::commands::get_info::{
    AuthenticatorInfo, AuthenticatorOptions, BioEnrollmentAvailability, ClientPinAvailability,
    GetInfo, UserVerificationAvailability,
};
use crate::ctap2::commands::get_next_assertion::GetNextAssertion;
use crate::ctap2::commands::make_credentials::MakeCredentials;
use crate::ctap2::commands::reset::{ResetRequest, ResetResponse};
use crate::ctap2::commands::{repair_invalid_utf8, RequestCtap2, StatusCode, Utf8FixupFn};
use crate::ctap2::server::{PublicKeyCredentialDescriptor, UserVerificationRequirement};
use crate::operation::{self, PendingOperation};
use crate::task::{FidoTask, GetAssertionTask, MakeCredentialTask, TaskStep};
use crate::transport::errors::TransportError;
use crate::transport::{Capability, FidoDevice, ProtocolVersion};

/// The slice of the embedder this crate consults: whether a PIN could be
/// collected from the user at all.
pub trait Observer {
    fn supports_pin(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeCredentialPinDisposition {
    /// Run the request without any PIN.
    NoPin,
    /// Collect the PIN and attach a PIN token to the request.
    UsePin,
    /// Set an initial PIN as part of this request's flow.
    SetPin,
    /// The request cannot be satisfied by this device.
    Unsatisfiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetAssertionPinDisposition {
    NoPin,
    UsePin,
    Unsatisfiable,
}

pub type InitCallback = Box<dyn FnOnce(StatusCode)>;
pub type GetTouchCallback = Box<dyn FnOnce()>;
pub type MakeCredentialCallback = Box<dyn FnOnce(StatusCode, Option<AttestationObject>)>;
pub type GetAssertionCallback = Box<dyn FnOnce(StatusCode, Option<GetAssertionResponse>)>;
pub type GetRetriesCallback = Box<dyn FnOnce(StatusCode, Option<RetriesResponse>)>;
pub type GetEphemeralKeyCallback = Box<dyn FnOnce(StatusCode, Option<KeyAgreementResponse>)>;
pub type GetPinTokenCallback = Box<dyn FnOnce(StatusCode, Option<TokenResponse>)>;
pub type SetPinCallback = Box<dyn FnOnce(StatusCode, Option<EmptyResponse>)>;
pub type ResetCallback = Box<dyn FnOnce(StatusCode, Option<ResetResponse>)>;
pub type CredentialsMetadataCallback =
    Box<dyn FnOnce(StatusCode, Option<CredentialsMetadataResponse>)>;
pub type EnumerateCredentialsCallback =
    Box<dyn FnOnce(StatusCode, Option<Vec<AggregatedEnumerateCredentialsResponse>>)>;
pub type DeleteCredentialCallback = Box<dyn FnOnce(StatusCode, Option<DeleteCredentialResponse>)>;
pub type BioEnrollmentCallback = Box<dyn FnOnce(StatusCode, Option<BioEnrollmentResponse>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Initialized,
}

/// Accumulator for one EnumerateCredentials call. Lives inside the
/// continuation closures and is dropped whole on any failure, so partial
/// results can never leak out.
struct EnumerateCredentialsState {
    pin_token: TokenResponse,
    is_first_rp: bool,
    is_first_credential: bool,
    rp_count: u64,
    current_rp_credential_count: u64,
    callback: EnumerateCredentialsCallback,
    responses: Vec<AggregatedEnumerateCredentialsResponse>,
}

pub struct FidoDeviceAuthenticator<D: FidoDevice + 'static> {
    device: D,
    state: State,
    protocol: Option<ProtocolVersion>,
    info: Option<AuthenticatorInfo>,
    options: Option<AuthenticatorOptions>,
    u2f_fallback: bool,
    task: Option<Box<dyn FidoTask<D>>>,
    operation: Option<PendingOperation<D>>,
}

impl<D: FidoDevice + 'static> FidoDeviceAuthenticator<D> {
    pub fn new(device: D) -> Self {
        FidoDeviceAuthenticator {
            device,
            state: State::Uninitialized,
            protocol: None,
            info: None,
            options: None,
            u2f_fallback: false,
            task: None,
            operation: None,
        }
    }

    /// Discover the supported protocol and, for CTAP2 devices, the
    /// capability snapshot. Must complete before any other operation.
    pub fn initialize(&mut self, callback: InitCallback) {
        assert_eq!(self.state, State::Uninitialized, "already initialized");

        if self.device.capabilities().contains(Capability::CBOR) {
            self.run_operation_internal(
                GetInfo::default(),
                None,
                move |authenticator, status, info: Option<AuthenticatorInfo>| match info {
                    Some(info) if status.is_ok() => {
                        authenticator.protocol = Some(ProtocolVersion::Ctap2);
                        authenticator.u2f_fallback = info.supports_u2f();
                        authenticator.options = Some(info.options().clone());
                        authenticator.info = Some(info);
                        authenticator.state = State::Initialized;
                        callback(StatusCode::OK);
                    }
                    _ => {
                        warn!(
                            "getInfo failed during initialization of {}: {:?}",
                            authenticator.device.id(),
                            status
                        );
                        callback(if status.is_ok() {
                            StatusCode::Other
                        } else {
                            status
                        });
                    }
                },
            );
        } else {
            // Pure U2F: there is no wire capability query; everything the
            // driver needs to know is "no options at all".
            self.protocol = Some(ProtocolVersion::U2f);
            self.options = Some(AuthenticatorOptions::default());
            self.state = State::Initialized;
            callback(StatusCode::OK);
        }
    }

    pub fn initialized(&self) -> bool {
        self.state == State::Initialized
    }

    pub fn id(&self) -> String {
        self.device.id()
    }

    pub fn supported_protocol(&self) -> ProtocolVersion {
        self.protocol
            .expect("initialize() must complete first")
    }

    pub fn options(&self) -> Option<&AuthenticatorOptions> {
        self.options.as_ref()
    }

    pub fn authenticator_info(&self) -> Option<&AuthenticatorInfo> {
        self.info.as_ref()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Deliver the reply (or failure) for the in-flight transfer. Panics if
    /// nothing is outstanding: replies with no request are a wiring bug in
    /// the embedder.
    pub fn handle_device_response(&mut self, result: Result<Vec<u8>, TransportError>) {
        if let Some(mut task) = self.task.take() {
            match task.on_device_response(&mut self.device, result) {
                TaskStep::Continue => self.task = Some(task),
                TaskStep::Finished => {}
            }
        } else if let Some(operation) = self.operation.take() {
            // The slot is already clear here, so the completion body may
            // immediately start the next operation.
            operation.complete(self, result);
        } else {
            panic!("device response with no outstanding operation");
        }
    }

    /// Forward a cancellation wish to the device if anything is in flight.
    /// The completion still arrives through `handle_device_response`.
    pub fn cancel(&mut self) {
        if self.task.is_some() || self.operation.is_some() {
            self.device.cancel();
        }
    }

    fn run_operation<Req, F>(&mut self, request: Req, fixup: Option<Utf8FixupFn>, on_done: F)
    where
        Req: RequestCtap2 + 'static,
        F: FnOnce(&mut Self, StatusCode, Option<Req::Output>) + 'static,
    {
        assert!(self.initialized(), "initialize() must complete first");
        self.run_operation_internal(request, fixup, on_done);
    }

    fn run_operation_internal<Req, F>(
        &mut self,
        request: Req,
        fixup: Option<Utf8FixupFn>,
        on_done: F,
    ) where
        Req: RequestCtap2 + 'static,
        F: FnOnce(&mut Self, StatusCode, Option<Req::Output>) + 'static,
    {
        assert!(
            self.task.is_none() && self.operation.is_none(),
            "operation already outstanding"
        );

        let frame = match operation::encode_request(&request) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode request: {}", e);
                on_done(self, StatusCode::Other, None);
                return;
            }
        };
        if let Err(e) = self.device.send(&frame) {
            warn!("device send failed: {}", e);
            on_done(self, StatusCode::DeviceError, None);
            return;
        }
        self.operation = Some(PendingOperation::new(request, fixup, on_done));
    }

    fn run_task(&mut self, mut task: Box<dyn FidoTask<D>>) {
        assert!(self.initialized(), "initialize() must complete first");
        assert!(
            self.task.is_none() && self.operation.is_none(),
            "operation already outstanding"
        );
        match task.start(&mut self.device) {
            TaskStep::Continue => self.task = Some(task),
            TaskStep::Finished => {}
        }
    }

    pub fn make_credential(&mut self, request: MakeCredentials, callback: MakeCredentialCallback) {
        let protocol = self.supported_protocol();
        self.run_task(Box::new(MakeCredentialTask::new(
            request, protocol, callback,
        )));
    }

    pub fn get_assertion(&mut self, request: GetAssertion, callback: GetAssertionCallback) {
        let protocol = self.supported_protocol();
        self.run_task(Box::new(GetAssertionTask::new(request, protocol, callback)));
    }

    pub fn get_next_assertion(&mut self, callback: GetAssertionCallback) {
        self.run_operation(
            GetNextAssertion::default(),
            Some(repair_invalid_utf8 as Utf8FixupFn),
            move |_, status, response| callback(status, response),
        );
    }

    /// Sense user presence with a throwaway MakeCredential. The PIN errors a
    /// PIN-capable device answers with still mean the user touched it, so
    /// they count as success; everything else is logged and swallowed
    /// because the caller only wants presence, never an error.
    pub fn get_touch(&mut self, callback: GetTouchCallback) {
        let id = self.id();
        self.make_credential(
            MakeCredentials::dummy_touch_request(),
            Box::new(move |status, _| match status {
                StatusCode::OK
                | StatusCode::PinNotSet
                | StatusCode::PinInvalid
                | StatusCode::PinAuthInvalid => callback(),
                other => {
                    debug!("Ignoring status {:?} from {}", other, id);
                }
            }),
        );
    }

    fn assert_client_pin_supported(&self) {
        let options = self.options.as_ref().expect("initialize() must complete first");
        assert!(
            options.client_pin_availability() != ClientPinAvailability::NotSupported,
            "client PIN not supported by this device"
        );
    }

    pub fn get_retries(&mut self, callback: GetRetriesCallback) {
        self.assert_client_pin_supported();
        self.run_operation(RetriesRequest::default(), None, move |_, status, response| {
            callback(status, response)
        });
    }

    /// Fetch the authenticator's ephemeral key. Must precede any PIN-token,
    /// SetPIN or ChangePIN call, which all encrypt against it.
    pub fn get_ephemeral_key(&mut self, callback: GetEphemeralKeyCallback) {
        self.assert_client_pin_supported();
        self.run_operation(
            KeyAgreementRequest::default(),
            None,
            move |_, status, response| callback(status, response),
        );
    }

    pub fn get_pin_token(
        &mut self,
        pin: Pin,
        peer_key: &KeyAgreementResponse,
        callback: GetPinTokenCallback,
    ) {
        self.assert_client_pin_supported();
        let request = match TokenRequest::new(&pin, peer_key) {
            Ok(request) => request,
            Err(e) => {
                error!("failed to build getPINToken: {}", e);
                callback(StatusCode::Other, None);
                return;
            }
        };
        self.run_operation(request, None, move |_, status, response| {
            callback(status, response)
        });
    }

    pub fn set_pin(
        &mut self,
        pin: Pin,
        peer_key: &KeyAgreementResponse,
        callback: SetPinCallback,
    ) {
        let options = self.options.as_ref().expect("initialize() must complete first");
        assert_eq!(
            options.client_pin_availability(),
            ClientPinAvailability::SupportedButPinNotSet,
            "setPIN requires PIN support with no PIN set"
        );
        let request = match SetRequest::new(&pin, peer_key) {
            Ok(request) => request,
            Err(e) => {
                error!("failed to build setPIN: {}", e);
                callback(StatusCode::Other, None);
                return;
            }
        };
        self.run_operation(request, None, move |_, status, response| {
            callback(status, response)
        });
    }

    pub fn change_pin(
        &mut self,
        old_pin: Pin,
        new_pin: Pin,
        peer_key: &KeyAgreementResponse,
        callback: SetPinCallback,
    ) {
        let options = self.options.as_ref().expect("initialize() must complete first");
        assert_eq!(
            options.client_pin_availability(),
            ClientPinAvailability::SupportedAndPinSet,
            "changePIN requires an existing PIN"
        );
        let request = match ChangeRequest::new(&old_pin, &new_pin, peer_key) {
            Ok(request) => request,
            Err(e) => {
                error!("failed to build changePIN: {}", e);
                callback(StatusCode::Other, None);
                return;
            }
        };
        self.run_operation(request, None, move |_, status, response| {
            callback(status, response)
        });
    }

    /// Decide up front whether MakeCredential will involve a PIN. The order
    /// of these rules is load-bearing; see the table-driven tests.
    pub fn will_need_pin_to_make_credential(
        &self,
        request: &MakeCredentials,
        observer: Option<&dyn Observer>,
    ) -> MakeCredentialPinDisposition {
        let options = self.options.as_ref().expect("initialize() must complete first");

        // Authenticators with built-in user verification use that instead.
        if options.user_verification_availability()
            == UserVerificationAvailability::SupportedAndConfigured
        {
            return MakeCredentialPinDisposition::NoPin;
        }

        let device_support = options.client_pin_availability();
        let can_collect_pin = observer.map_or(false, |o| o.supports_pin());

        // CTAP 2.0 requires a PIN for credential creation once a PIN has
        // been set. Thus, if fallback to U2F isn't possible, a PIN will be
        // needed if set.
        if device_support == ClientPinAvailability::SupportedAndPinSet && !self.u2f_fallback {
            if can_collect_pin {
                return MakeCredentialPinDisposition::UsePin;
            } else {
                return MakeCredentialPinDisposition::Unsatisfiable;
            }
        }

        // If a PIN cannot be collected and UV is required, then this request
        // cannot be met.
        if request.user_verification_req == UserVerificationRequirement::Required
            && (!can_collect_pin || device_support == ClientPinAvailability::NotSupported)
        {
            return MakeCredentialPinDisposition::Unsatisfiable;
        }

        // If UV is required and a PIN can be set, set it during this
        // MakeCredential flow.
        if device_support == ClientPinAvailability::SupportedButPinNotSet
            && request.user_verification_req == UserVerificationRequirement::Required
        {
            return MakeCredentialPinDisposition::SetPin;
        }

        // If discouraged, either no PIN is set or the U2F fallback creates
        // the credential without one.
        if request.user_verification_req == UserVerificationRequirement::Discouraged {
            return MakeCredentialPinDisposition::NoPin;
        }

        if device_support == ClientPinAvailability::SupportedAndPinSet && can_collect_pin {
            return MakeCredentialPinDisposition::UsePin;
        }

        MakeCredentialPinDisposition::NoPin
    }

    pub fn will_need_pin_to_get_assertion(
        &self,
        request: &GetAssertion,
        observer: Option<&dyn Observer>,
    ) -> GetAssertionPinDisposition {
        let options = self.options.as_ref().expect("initialize() must complete first");

        if options.user_verification_availability()
            == UserVerificationAvailability::SupportedAndConfigured
        {
            return GetAssertionPinDisposition::NoPin;
        }

        // The PIN is effectively unavailable without UI support for
        // collecting it.
        let can_use_pin = options.client_pin_availability()
            == ClientPinAvailability::SupportedAndPinSet
            && observer.map_or(false, |o| o.supports_pin());

        // Resident-key retrieval mandates user verification.
        if request.is_resident_key_request() {
            if can_use_pin {
                return GetAssertionPinDisposition::UsePin;
            }
            return GetAssertionPinDisposition::Unsatisfiable;
        }

        if request.user_verification_req == UserVerificationRequirement::Required {
            if can_use_pin {
                return GetAssertionPinDisposition::UsePin;
            }
            return GetAssertionPinDisposition::Unsatisfiable;
        }

        if request.user_verification_req == UserVerificationRequirement::Preferred && can_use_pin {
            return GetAssertionPinDisposition::UsePin;
        }
        GetAssertionPinDisposition::NoPin
    }

    fn credential_management_version(&self) -> CredentialManagementVersion {
        let options = self.options.as_ref().expect("initialize() must complete first");
        assert!(
            options.supports_credential_management()
                || options.supports_credential_management_preview(),
            "credential management not supported by this device"
        );
        if options.supports_credential_management() {
            CredentialManagementVersion::Default
        } else {
            CredentialManagementVersion::Preview
        }
    }

    pub fn get_credentials_metadata(
        &mut self,
        pin_token: &TokenResponse,
        callback: CredentialsMetadataCallback,
    ) {
        let version = self.credential_management_version();
        let request = match CredentialsMetadataRequest::new(version, pin_token) {
            Ok(request) => request,
            Err(e) => {
                error!("failed to build getCredsMetadata: {}", e);
                callback(StatusCode::Other, None);
                return;
            }
        };
        self.run_operation(request, None, move |_, status, response| {
            callback(status, response)
        });
    }

    /// Drain every resident credential, grouped by relying party: one
    /// RPsBegin, then per RP one CredentialsBegin plus as many GetNexts as
    /// the counts captured on the first pages demand. Any failure anywhere
    /// aborts the whole walk and discards what was collected.
    pub fn enumerate_credentials(
        &mut self,
        pin_token: TokenResponse,
        callback: EnumerateCredentialsCallback,
    ) {
        let version = self.credential_management_version();
        let request = match EnumerateRPsRequest::begin(version, &pin_token) {
            Ok(request) => request,
            Err(e) => {
                error!("failed to build enumerateRPsBegin: {}", e);
                callback(StatusCode::Other, None);
                return;
            }
        };
        let state = EnumerateCredentialsState {
            pin_token,
            is_first_rp: true,
            is_first_credential: true,
            rp_count: 0,
            current_rp_credential_count: 0,
            callback,
            responses: Vec::new(),
        };
        self.run_operation(
            request,
            Some(repair_invalid_utf8 as Utf8FixupFn),
            move |authenticator, status, response| {
                authenticator.on_enumerate_rps_done(state, status, response)
            },
        );
    }

    fn on_enumerate_rps_done(
        &mut self,
        mut state: EnumerateCredentialsState,
        status: StatusCode,
        response: Option<EnumerateRPsResponse>,
    ) {
        if !status.is_ok() {
            (state.callback)(status, None);
            return;
        }
        let response = match response {
            Some(response) => response,
            None => {
                (state.callback)(StatusCode::Other, None);
                return;
            }
        };
        if state.is_first_rp {
            if response.rp_count == 0 {
                (state.callback)(StatusCode::OK, Some(state.responses));
                return;
            }
            state.rp_count = response.rp_count;
            state.is_first_rp = false;
        }

        let (rp, rp_id_hash) = match (response.rp, response.rp_id_hash) {
            (Some(rp), Some(rp_id_hash)) => (rp, rp_id_hash),
            _ => {
                (state.callback)(StatusCode::Other, None);
                return;
            }
        };

        state.is_first_credential = true;
        state.responses.push(AggregatedEnumerateCredentialsResponse {
            rp,
            rp_id_hash,
            credentials: Vec::new(),
        });

        let version = self.credential_management_version();
        let request =
            match EnumerateCredentialsRequest::begin(version, &state.pin_token, rp_id_hash) {
                Ok(request) => request,
                Err(e) => {
                    error!("failed to build enumerateCredentialsBegin: {}", e);
                    (state.callback)(StatusCode::Other, None);
                    return;
                }
            };
        self.run_operation(
            request,
            Some(repair_invalid_utf8 as Utf8FixupFn),
            move |authenticator, status, response| {
                authenticator.on_enumerate_credentials_done(state, status, response)
            },
        );
    }

    fn on_enumerate_credentials_done(
        &mut self,
        mut state: EnumerateCredentialsState,
        status: StatusCode,
        response: Option<EnumerateCredentialsResponse>,
    ) {
        if !status.is_ok() {
            (state.callback)(status, None);
            return;
        }
        let response = match response {
            Some(response) => response,
            None => {
                (state.callback)(StatusCode::Other, None);
                return;
            }
        };
        if state.is_first_credential {
            state.current_rp_credential_count = response.credential_count;
            state.is_first_credential = false;
        }
        let current = state
            .responses
            .last_mut()
            .expect("credentials arrive after their RP");
        current.credentials.push(response);

        let version = self.credential_management_version();
        if (current.credentials.len() as u64) < state.current_rp_credential_count {
            self.run_operation(
                EnumerateCredentialsRequest::get_next(version),
                Some(repair_invalid_utf8 as Utf8FixupFn),
                move |authenticator, status, response| {
                    authenticator.on_enumerate_credentials_done(state, status, response)
                },
            );
            return;
        }

        if (state.responses.len() as u64) < state.rp_count {
            self.run_operation(
                EnumerateRPsRequest::get_next(version),
                Some(repair_invalid_utf8 as Utf8FixupFn),
                move |authenticator, status, response| {
                    authenticator.on_enumerate_rps_done(state, status, response)
                },
            );
            return;
        }

        (state.callback)(StatusCode::OK, Some(state.responses));
    }

    pub fn delete_credential(
        &mut self,
        pin_token: &TokenResponse,
        credential_id: PublicKeyCredentialDescriptor,
        callback: DeleteCredentialCallback,
    ) {
        let version = self.credential_management_version();
        let request = match DeleteCredentialRequest::new(version, pin_token, credential_id) {
            Ok(request) => request,
            Err(e) => {
                error!("failed to build deleteCredential: {}", e);
                callback(StatusCode::Other, None);
                return;
            }
        };
        self.run_operation(request, None, move |_, status, response| {
            callback(status, response)
        });
    }

    fn bio_enrollment_version(&self) -> BioEnrollmentVersion {
        let options = self.options.as_ref().expect("initialize() must complete first");
        assert!(
            options.bio_enrollment_availability() != BioEnrollmentAvailability::NotSupported
                || options.bio_enrollment_preview_availability()
                    != BioEnrollmentAvailability::NotSupported,
            "bio enrollment not supported by this device"
        );
        if options.bio_enrollment_availability() != BioEnrollmentAvailability::NotSupported {
            BioEnrollmentVersion::Default
        } else {
            BioEnrollmentVersion::Preview
        }
    }

    fn run_bio_operation(&mut self, request: BioEnrollmentRequest, callback: BioEnrollmentCallback) {
        self.run_operation(request, None, move |_, status, response| {
            callback(status, response)
        });
    }

    pub fn get_modality(&mut self, callback: BioEnrollmentCallback) {
        let version = self.bio_enrollment_version();
        self.run_bio_operation(BioEnrollmentRequest::for_get_modality(version), callback);
    }

    pub fn get_sensor_info(&mut self, callback: BioEnrollmentCallback) {
        let version = self.bio_enrollment_version();
        self.run_bio_operation(BioEnrollmentRequest::for_get_sensor_info(version), callback);
    }

    /// Capture fingerprint samples until the sensor is satisfied: one
    /// EnrollBegin, then EnrollCaptureNextSample with the template id from
    /// the first response until `remaining_samples` hits zero. A first
    /// response without a template id fails the whole enrollment.
    pub fn bio_enroll_fingerprint(
        &mut self,
        pin_token: TokenResponse,
        callback: BioEnrollmentCallback,
    ) {
        let version = self.bio_enrollment_version();
        let request = match BioEnrollmentRequest::for_enroll_begin(version, &pin_token) {
            Ok(request) => request,
            Err(e) => {
                error!("failed to build enrollBegin: {}", e);
                callback(StatusCode::Other, None);
                return;
            }
        };
        self.run_operation(request, None, move |authenticator, status, response| {
            authenticator.on_bio_enroll(pin_token, callback, None, status, response)
        });
    }

    fn on_bio_enroll(
        &mut self,
        pin_token: TokenResponse,
        callback: BioEnrollmentCallback,
        current_template_id: Option<Vec<u8>>,
        status: StatusCode,
        response: Option<BioEnrollmentResponse>,
    ) {
        if !status.is_ok() {
            callback(status, response);
            return;
        }
        let response = match response {
            Some(response) => response,
            None => {
                callback(StatusCode::Other, None);
                return;
            }
        };
        if response.remaining_samples == Some(0) {
            callback(status, Some(response));
            return;
        }

        let template_id = match current_template_id {
            Some(id) => id,
            None => match response.template_id.clone() {
                Some(id) => id,
                None => {
                    // The templateId field is required in the first response
                    // of each enrollment.
                    callback(StatusCode::Other, None);
                    return;
                }
            },
        };

        let version = self.bio_enrollment_version();
        let request = match BioEnrollmentRequest::for_enroll_next_sample(
            version,
            &pin_token,
            template_id.clone(),
        ) {
            Ok(request) => request,
            Err(e) => {
                error!("failed to build enrollCaptureNextSample: {}", e);
                callback(StatusCode::Other, None);
                return;
            }
        };
        self.run_operation(request, None, move |authenticator, status, response| {
            authenticator.on_bio_enroll(pin_token, callback, Some(template_id), status, response)
        });
    }

    pub fn bio_enroll_cancel(&mut self, callback: BioEnrollmentCallback) {
        let version = self.bio_enrollment_version();
        self.run_bio_operation(BioEnrollmentRequest::for_cancel(version), callback);
    }

    pub fn bio_enroll_enumerate(
        &mut self,
        pin_token: &TokenResponse,
        callback: BioEnrollmentCallback,
    ) {
        let version = self.bio_enrollment_version();
        match BioEnrollmentRequest::for_enumerate(version, pin_token) {
            Ok(request) => self.run_bio_operation(request, callback),
            Err(e) => {
                error!("failed to build enumerateEnrollments: {}", e);
                callback(StatusCode::Other, None);
            }
        }
    }

    pub fn bio_enroll_rename(
        &mut self,
        pin_token: &TokenResponse,
        template_id: Vec<u8>,
        name: String,
        callback: BioEnrollmentCallback,
    ) {
        let version = self.bio_enrollment_version();
        match BioEnrollmentRequest::for_rename(version, pin_token, template_id, name) {
            Ok(request) => self.run_bio_operation(request, callback),
            Err(e) => {
                error!("failed to build setFriendlyName: {}", e);
                callback(StatusCode::Other, None);
            }
        }
    }

    pub fn bio_enroll_delete(
        &mut self,
        pin_token: &TokenResponse,
        template_id: Vec<u8>,
        callback: BioEnrollmentCallback,
    ) {
        let version = self.bio_enrollment_version();
        match BioEnrollmentRequest::for_delete(version, pin_token, template_id) {
            Ok(request) => self.run_bio_operation(request, callback),
            Err(e) => {
                error!("failed to build removeEnrollment: {}", e);
                callback(StatusCode::Other, None);
            }
        }
    }

    pub fn reset(&mut self, callback: ResetCallback) {
        self.run_operation(ResetRequest::default(), None, move |_, status, response| {
            callback(status, response)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctap2::commands::client_pin::tests::{device_key_pair, key_agreement_body};
    use crate::ctap2::server::{RelyingParty, User};
    use serde_cbor::Value;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use crate::transport::test::TestDevice;

    struct PinObserver(bool);

    impl Observer for PinObserver {
        fn supports_pin(&self) -> bool {
            self.0
        }
    }

    fn pump(authenticator: &mut FidoDeviceAuthenticator<TestDevice>) {
        while let Some(reply) = authenticator.device_mut().take_reply() {
            authenticator.handle_device_response(reply);
        }
    }

    fn ok_reply(body: &[u8]) -> Vec<u8> {
        let mut reply = vec![0x00];
        reply.extend_from_slice(body);
        reply
    }

    fn cbor_map(entries: Vec<(i128, Value)>) -> Vec<u8> {
        let map: BTreeMap<Value, Value> = entries
            .into_iter()
            .map(|(k, v)| (Value::Integer(k), v))
            .collect();
        serde_cbor::to_vec(&Value::Map(map)).unwrap()
    }

    fn info_body(versions: &[&str], options: &[(&str, bool)]) -> Vec<u8> {
        let option_map: BTreeMap<Value, Value> = options
            .iter()
            .map(|(k, v)| (Value::Text(k.to_string()), Value::Bool(*v)))
            .collect();
        cbor_map(vec![
            (
                1,
                Value::Array(versions.iter().map(|v| Value::Text(v.to_string())).collect()),
            ),
            (3, Value::Bytes(vec![0u8; 16])),
            (4, Value::Map(option_map)),
        ])
    }

    fn ctap2_authenticator(
        versions: &[&str],
        options: &[(&str, bool)],
    ) -> FidoDeviceAuthenticator<TestDevice> {
        let mut device = TestDevice::ctap2();
        device.add_write(&[0x04]);
        device.add_read(&ok_reply(&info_body(versions, options)));
        let mut authenticator = FidoDeviceAuthenticator::new(device);
        let done = Rc::new(RefCell::new(false));
        let flag = done.clone();
        authenticator.initialize(Box::new(move |status| {
            assert!(status.is_ok());
            *flag.borrow_mut() = true;
        }));
        pump(&mut authenticator);
        assert!(*done.borrow(), "initialization did not complete");
        authenticator
    }

    fn u2f_authenticator() -> FidoDeviceAuthenticator<TestDevice> {
        let mut authenticator = FidoDeviceAuthenticator::new(TestDevice::u2f());
        authenticator.initialize(Box::new(|status| assert!(status.is_ok())));
        authenticator
    }

    fn test_token(byte: u8) -> TokenResponse {
        TokenResponse::for_tests(vec![byte; 32])
    }

    fn sample_make_credential(
        uv: UserVerificationRequirement,
    ) -> crate::ctap2::commands::make_credentials::MakeCredentials {
        use crate::ctap2::commands::make_credentials::MakeCredentialsOptions;
        use crate::ctap2::server::{ClientDataHash, PublicKeyCredentialParameters};
        MakeCredentials::new(
            ClientDataHash([0x0C; 32]),
            RelyingParty::from_id("example.com"),
            User {
                id: vec![0x01],
                name: None,
                display_name: None,
                icon: None,
            },
            vec![PublicKeyCredentialParameters::es256()],
            Vec::new(),
            MakeCredentialsOptions::default(),
            uv,
        )
    }

    fn sample_get_assertion(
        uv: UserVerificationRequirement,
        allow_list: Vec<PublicKeyCredentialDescriptor>,
    ) -> GetAssertion {
        use crate::ctap2::commands::get_assertion::GetAssertionOptions;
        use crate::ctap2::server::ClientDataHash;
        GetAssertion::new(
            ClientDataHash([0x0D; 32]),
            RelyingParty::from_id("example.com"),
            allow_list,
            GetAssertionOptions::default(),
            uv,
        )
    }

    #[test]
    fn initializes_pure_u2f_devices_without_wire_traffic() {
        let authenticator = u2f_authenticator();
        assert_eq!(authenticator.supported_protocol(), ProtocolVersion::U2f);
        assert_eq!(
            authenticator.options().unwrap().client_pin_availability(),
            ClientPinAvailability::NotSupported
        );
        assert!(authenticator.device().requests.is_empty());
    }

    #[test]
    fn initializes_ctap2_devices_from_get_info() {
        let authenticator = ctap2_authenticator(
            &["U2F_V2", "FIDO_2_0"],
            &[("rk", true), ("up", true), ("clientPin", false)],
        );
        assert_eq!(authenticator.supported_protocol(), ProtocolVersion::Ctap2);
        assert_eq!(
            authenticator.options().unwrap().client_pin_availability(),
            ClientPinAvailability::SupportedButPinNotSet
        );
        assert_eq!(authenticator.device().requests, vec![vec![0x04]]);
    }

    #[test]
    #[should_panic(expected = "already initialized")]
    fn double_initialize_is_a_bug() {
        let mut authenticator = u2f_authenticator();
        authenticator.initialize(Box::new(|_| {}));
    }

    #[test]
    fn get_retries_is_idempotent() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", true)]);
        let retries_exchange = |device: &mut TestDevice| {
            device.add_write(&[0x06, 0xA2, 0x01, 0x01, 0x02, 0x01]);
            device.add_read(&ok_reply(&[0xA1, 0x03, 0x08]));
        };
        retries_exchange(authenticator.device_mut());
        retries_exchange(authenticator.device_mut());

        let counts = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let sink = counts.clone();
            authenticator.get_retries(Box::new(move |status, response| {
                assert!(status.is_ok());
                sink.borrow_mut().push(response.unwrap().pin_retries);
            }));
            pump(&mut authenticator);
        }
        assert_eq!(*counts.borrow(), vec![8, 8]);
        assert!(authenticator.device().all_scripts_consumed());
    }

    #[test]
    #[should_panic(expected = "operation already outstanding")]
    fn starting_a_second_operation_while_one_is_in_flight_panics() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", true)]);
        // No scripted reply: the first operation stays in flight.
        authenticator.get_retries(Box::new(|_, _| {}));
        authenticator.get_retries(Box::new(|_, _| {}));
    }

    #[test]
    #[should_panic(expected = "no outstanding operation")]
    fn unsolicited_device_response_panics() {
        let mut authenticator = u2f_authenticator();
        authenticator.handle_device_response(Ok(vec![0x00]));
    }

    #[test]
    #[should_panic(expected = "client PIN not supported")]
    fn pin_operations_require_pin_capability() {
        let mut authenticator = ctap2_authenticator(&["FIDO_2_0"], &[]);
        authenticator.get_retries(Box::new(|_, _| {}));
    }

    #[test]
    fn get_touch_counts_pin_errors_as_touch() {
        for status_byte in [0x00u8, 0x35, 0x31, 0x33] {
            let mut authenticator =
                ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", true)]);
            authenticator.device_mut().add_read(&[status_byte]);
            let touched = Rc::new(RefCell::new(false));
            let flag = touched.clone();
            authenticator.get_touch(Box::new(move || *flag.borrow_mut() = true));
            pump(&mut authenticator);
            assert!(
                *touched.borrow(),
                "status {:#x} should count as touch",
                status_byte
            );
        }
    }

    #[test]
    fn get_touch_swallows_other_errors() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", true)]);
        authenticator.device_mut().add_read(&[0x27]); // OperationDenied
        let touched = Rc::new(RefCell::new(false));
        let flag = touched.clone();
        authenticator.get_touch(Box::new(move || *flag.borrow_mut() = true));
        pump(&mut authenticator);
        assert!(!*touched.borrow());
    }

    #[test]
    fn set_pin_works_when_no_pin_is_set() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", false)]);
        authenticator.device_mut().add_read(&[0x00]);
        let (_, peer) = device_key_pair();
        let done = Rc::new(RefCell::new(false));
        let flag = done.clone();
        authenticator.set_pin(
            Pin::new("1234").unwrap(),
            &peer,
            Box::new(move |status, response| {
                assert!(status.is_ok());
                assert!(response.is_some());
                *flag.borrow_mut() = true;
            }),
        );
        pump(&mut authenticator);
        assert!(*done.borrow());
    }

    #[test]
    #[should_panic(expected = "changePIN requires an existing PIN")]
    fn change_pin_rejects_devices_without_a_pin() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", false)]);
        let (_, peer) = device_key_pair();
        authenticator.change_pin(
            Pin::new("1234").unwrap(),
            Pin::new("5678").unwrap(),
            &peer,
            Box::new(|_, _| {}),
        );
    }

    #[test]
    fn pin_token_round_trip_through_the_facade() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", true)]);
        let (device_key, peer) = device_key_pair();

        // getKeyAgreement
        authenticator
            .device_mut()
            .add_read(&ok_reply(&key_agreement_body(&peer.0.x, &peer.0.y)));
        let got_peer = Rc::new(RefCell::new(None));
        let sink = got_peer.clone();
        authenticator.get_ephemeral_key(Box::new(move |status, response| {
            assert!(status.is_ok());
            *sink.borrow_mut() = response;
        }));
        pump(&mut authenticator);
        let got_peer = got_peer.borrow_mut().take().unwrap();
        assert_eq!(got_peer, peer);

        // getPINToken: answer with a token encrypted under the shared secret
        // derived, authenticator-side, from the platform key in the request.
        let token = Rc::new(RefCell::new(None));
        let sink = token.clone();
        authenticator.get_pin_token(
            Pin::new("1234").unwrap(),
            &got_peer,
            Box::new(move |status, response| {
                assert!(status.is_ok());
                *sink.borrow_mut() = response;
            }),
        );
        let request = authenticator.device().last_request().to_vec();
        assert_eq!(request[0], 0x06);
        let value: Value = serde_cbor::from_slice(&request[1..]).unwrap();
        let platform_key = match value {
            Value::Map(map) => match map.get(&Value::Integer(3)).unwrap() {
                Value::Map(cose) => {
                    let coord = |key: i128| -> [u8; 32] {
                        match cose.get(&Value::Integer(key)).unwrap() {
                            Value::Bytes(bytes) => {
                                let mut out = [0u8; 32];
                                out.copy_from_slice(bytes);
                                out
                            }
                            other => panic!("coordinate must be bytes, got {:?}", other),
                        }
                    };
                    (coord(-2), coord(-3))
                }
                other => panic!("keyAgreement must be a map, got {:?}", other),
            },
            other => panic!("request must be a map, got {:?}", other),
        };
        let device_shared = device_key
            .shared_secret(&platform_key.0, &platform_key.1)
            .unwrap();
        let token_plain = [0x5A; 32];
        let token_enc = device_shared.encrypt(&token_plain).unwrap();
        let body = cbor_map(vec![(2, Value::Bytes(token_enc))]);
        authenticator.handle_device_response(Ok(ok_reply(&body)));

        let token = token.borrow_mut().take().unwrap();
        assert_eq!(token.as_bytes(), &token_plain[..]);
    }

    fn rp_page(id: &str, hash: u8, total: Option<u64>) -> Vec<u8> {
        let mut entries = vec![
            (
                3,
                Value::Map(
                    vec![(Value::Text("id".to_string()), Value::Text(id.to_string()))]
                        .into_iter()
                        .collect(),
                ),
            ),
            (4, Value::Bytes(vec![hash; 32])),
        ];
        if let Some(total) = total {
            entries.push((5, Value::Integer(i128::from(total))));
        }
        cbor_map(entries)
    }

    fn credential_page(id: u8, total: Option<u64>) -> Vec<u8> {
        let mut entries = vec![
            (
                6,
                Value::Map(
                    vec![(Value::Text("id".to_string()), Value::Bytes(vec![id]))]
                        .into_iter()
                        .collect(),
                ),
            ),
            (
                7,
                Value::Map(
                    vec![
                        (Value::Text("id".to_string()), Value::Bytes(vec![id; 8])),
                        (
                            Value::Text("type".to_string()),
                            Value::Text("public-key".to_string()),
                        ),
                    ]
                    .into_iter()
                    .collect(),
                ),
            ),
        ];
        if let Some(total) = total {
            entries.push((9, Value::Integer(i128::from(total))));
        }
        cbor_map(entries)
    }

    #[test]
    fn enumerate_credentials_with_zero_rps_short_circuits() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("credMgmt", true)]);
        authenticator
            .device_mut()
            .add_read(&ok_reply(&cbor_map(vec![(5, Value::Integer(0))])));
        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        authenticator.enumerate_credentials(
            test_token(0x42),
            Box::new(move |status, responses| {
                assert!(status.is_ok());
                *sink.borrow_mut() = responses;
            }),
        );
        pump(&mut authenticator);
        assert_eq!(result.borrow_mut().take().unwrap(), Vec::new());
        // getInfo plus exactly one RPsBegin; no further sub-requests.
        assert_eq!(authenticator.device().requests.len(), 2);
    }

    #[test]
    fn enumerate_credentials_drains_every_rp() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("credMgmt", true)]);
        {
            let device = authenticator.device_mut();
            device.add_read(&ok_reply(&rp_page("one.example", 0x11, Some(2))));
            device.add_read(&ok_reply(&credential_page(0xA1, Some(2))));
            device.add_read(&ok_reply(&credential_page(0xA2, None)));
            device.add_read(&ok_reply(&rp_page("two.example", 0x22, None)));
            device.add_read(&ok_reply(&credential_page(0xB1, Some(1))));
        }

        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        authenticator.enumerate_credentials(
            test_token(0x42),
            Box::new(move |status, responses| {
                assert!(status.is_ok());
                *sink.borrow_mut() = responses;
            }),
        );
        pump(&mut authenticator);

        let groups = result.borrow_mut().take().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].rp.id, "one.example");
        assert_eq!(groups[0].credentials.len(), 2);
        assert_eq!(groups[1].rp.id, "two.example");
        assert_eq!(groups[1].credentials.len(), 1);
        let total: usize = groups.iter().map(|g| g.credentials.len()).sum();
        assert_eq!(total, 3);
        // getInfo + RPsBegin + CredBegin + CredNext + RPsNext + CredBegin.
        assert_eq!(authenticator.device().requests.len(), 6);
    }

    #[test]
    fn enumerate_credentials_aborts_and_discards_on_error() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("credMgmt", true)]);
        {
            let device = authenticator.device_mut();
            device.add_read(&ok_reply(&rp_page("one.example", 0x11, Some(2))));
            device.add_read(&[0x31]); // PinInvalid on the first CredBegin
        }
        let outcome = Rc::new(RefCell::new(None));
        let sink = outcome.clone();
        authenticator.enumerate_credentials(
            test_token(0x42),
            Box::new(move |status, responses| {
                *sink.borrow_mut() = Some((status, responses.is_some()));
            }),
        );
        pump(&mut authenticator);
        assert_eq!(
            outcome.borrow_mut().take().unwrap(),
            (StatusCode::PinInvalid, false)
        );
    }

    #[test]
    fn get_credentials_metadata_reports_counts() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("credentialMgmtPreview", true)]);
        authenticator.device_mut().add_read(&ok_reply(&cbor_map(vec![
            (1, Value::Integer(5)),
            (2, Value::Integer(20)),
        ])));
        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        let token = test_token(0x42);
        authenticator.get_credentials_metadata(
            &token,
            Box::new(move |status, response| {
                assert!(status.is_ok());
                *sink.borrow_mut() = response;
            }),
        );
        pump(&mut authenticator);
        let metadata = result.borrow_mut().take().unwrap();
        assert_eq!(metadata.existing_resident_credentials, 5);
        assert_eq!(metadata.max_possible_remaining, 20);
        // The preview command byte is used when only the preview is listed.
        assert_eq!(authenticator.device().last_request()[0], 0x41);
    }

    #[test]
    fn bio_enrollment_collects_samples_until_done() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("bioEnroll", false)]);
        {
            let device = authenticator.device_mut();
            device.add_read(&ok_reply(&cbor_map(vec![
                (4, Value::Bytes(vec![0xAA, 0xBB])),
                (5, Value::Integer(0)),
                (6, Value::Integer(2)),
            ])));
            device.add_read(&ok_reply(&cbor_map(vec![
                (5, Value::Integer(0)),
                (6, Value::Integer(1)),
            ])));
            device.add_read(&ok_reply(&cbor_map(vec![
                (5, Value::Integer(0)),
                (6, Value::Integer(0)),
            ])));
        }
        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        authenticator.bio_enroll_fingerprint(
            test_token(0x24),
            Box::new(move |status, response| {
                assert!(status.is_ok());
                *sink.borrow_mut() = response;
            }),
        );
        pump(&mut authenticator);
        let response = result.borrow_mut().take().unwrap();
        assert_eq!(response.remaining_samples, Some(0));
        // getInfo + EnrollBegin + two EnrollCaptureNextSample rounds.
        assert_eq!(authenticator.device().requests.len(), 4);
    }

    #[test]
    fn bio_enrollment_requires_a_template_id_up_front() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("bioEnroll", false)]);
        authenticator.device_mut().add_read(&ok_reply(&cbor_map(vec![
            (5, Value::Integer(0)),
            (6, Value::Integer(2)),
        ])));
        let outcome = Rc::new(RefCell::new(None));
        let sink = outcome.clone();
        authenticator.bio_enroll_fingerprint(
            test_token(0x24),
            Box::new(move |status, response| {
                *sink.borrow_mut() = Some((status, response.is_some()));
            }),
        );
        pump(&mut authenticator);
        assert_eq!(
            outcome.borrow_mut().take().unwrap(),
            (StatusCode::Other, false)
        );
    }

    #[test]
    fn cancel_reaches_the_device_only_when_something_is_in_flight() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", true)]);
        authenticator.cancel();
        assert_eq!(authenticator.device().cancels, 0);

        authenticator.get_retries(Box::new(|_, _| {}));
        authenticator.cancel();
        assert_eq!(authenticator.device().cancels, 1);

        // The reply still arrives through the normal completion path.
        authenticator.handle_device_response(Ok(vec![0x2D])); // KeepaliveCancel
    }

    #[test]
    fn make_credential_over_ctap2() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", true)]);
        let mut auth_data = Vec::new();
        auth_data.extend_from_slice(&[0x66; 32]);
        auth_data.push(0x01);
        auth_data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        let body = cbor_map(vec![
            (1, Value::Text("packed".to_string())),
            (2, Value::Bytes(auth_data)),
            (3, Value::Map(BTreeMap::new())),
        ]);
        authenticator.device_mut().add_read(&ok_reply(&body));

        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        authenticator.make_credential(
            sample_make_credential(UserVerificationRequirement::Discouraged),
            Box::new(move |status, response| {
                assert!(status.is_ok());
                *sink.borrow_mut() = response;
            }),
        );
        pump(&mut authenticator);
        let attestation = result.borrow_mut().take().unwrap();
        assert_eq!(attestation.fmt, "packed");
        assert_eq!(authenticator.device().last_request()[0], 0x01);
    }

    #[test]
    fn u2f_register_retries_until_touched() {
        let mut authenticator = u2f_authenticator();
        {
            let device = authenticator.device_mut();
            device.add_read(&[0x69, 0x85]); // conditions not satisfied
            let mut msg = vec![0x05];
            msg.extend_from_slice(&[0x04; 65]);
            msg.push(2);
            msg.extend_from_slice(&[0x0A, 0x0B]);
            msg.extend_from_slice(&[0x30, 0x02, 0x01, 0x02]);
            msg.extend_from_slice(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02]);
            msg.extend_from_slice(&[0x90, 0x00]);
            device.add_read(&msg);
        }
        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        authenticator.make_credential(
            sample_make_credential(UserVerificationRequirement::Discouraged),
            Box::new(move |status, response| {
                assert!(status.is_ok());
                *sink.borrow_mut() = response;
            }),
        );
        pump(&mut authenticator);
        let attestation = result.borrow_mut().take().unwrap();
        assert_eq!(attestation.fmt, "fido-u2f");
        let credential = attestation.auth_data.credential_data.unwrap();
        assert_eq!(credential.credential_id, vec![0x0A, 0x0B]);
        // Same register APDU twice: once before, once after the touch poll.
        assert_eq!(authenticator.device().requests.len(), 2);
        assert_eq!(
            authenticator.device().requests[0],
            authenticator.device().requests[1]
        );
    }

    #[test]
    fn u2f_sign_probes_the_allow_list() {
        let mut authenticator = u2f_authenticator();
        {
            let device = authenticator.device_mut();
            device.add_read(&[0x6A, 0x80]); // first handle: wrong data
            device.add_read(&[0x69, 0x85]); // second handle: valid
            let mut msg = vec![0x01, 0x00, 0x00, 0x00, 0x2A];
            msg.extend_from_slice(&[0x30, 0x44, 0x02, 0x20]);
            msg.extend_from_slice(&[0x90, 0x00]);
            device.add_read(&msg);
        }
        let handles = vec![
            PublicKeyCredentialDescriptor::new(vec![0x11; 16]),
            PublicKeyCredentialDescriptor::new(vec![0x22; 16]),
        ];
        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        authenticator.get_assertion(
            sample_get_assertion(UserVerificationRequirement::Discouraged, handles),
            Box::new(move |status, response| {
                assert!(status.is_ok());
                *sink.borrow_mut() = response;
            }),
        );
        pump(&mut authenticator);
        let assertion = result.borrow_mut().take().unwrap();
        assert_eq!(assertion.credentials.unwrap().id, vec![0x22; 16]);
        assert_eq!(assertion.auth_data.counter, 42);
        assert_eq!(authenticator.device().requests.len(), 3);
    }

    #[test]
    fn u2f_resident_requests_fail_without_traffic() {
        let mut authenticator = u2f_authenticator();
        let outcome = Rc::new(RefCell::new(None));
        let sink = outcome.clone();
        authenticator.get_assertion(
            sample_get_assertion(UserVerificationRequirement::Discouraged, Vec::new()),
            Box::new(move |status, response| {
                *sink.borrow_mut() = Some((status, response.is_some()));
            }),
        );
        assert_eq!(
            outcome.borrow_mut().take().unwrap(),
            (StatusCode::NoCredentials, false)
        );
        assert!(authenticator.device().requests.is_empty());
    }

    #[test]
    fn reset_round_trip() {
        let mut authenticator =
            ctap2_authenticator(&["FIDO_2_0"], &[("clientPin", true)]);
        authenticator.device_mut().add_read(&[0x00]);
        let done = Rc::new(RefCell::new(false));
        let flag = done.clone();
        authenticator.reset(Box::new(move |status, response| {
            assert!(status.is_ok());
            assert!(response.is_some());
            *flag.borrow_mut() = true;
        }));
        pump(&mut authenticator);
        assert!(*done.borrow());
        assert_eq!(authenticator.device().last_request(), &[0x07]);
    }

    fn disposition_fixture(
        client_pin: Option<bool>,
        uv: Option<bool>,
        u2f: bool,
    ) -> FidoDeviceAuthenticator<TestDevice> {
        let mut options: Vec<(&str, bool)> = Vec::new();
        if let Some(pin) = client_pin {
            options.push(("clientPin", pin));
        }
        if let Some(uv) = uv {
            options.push(("uv", uv));
        }
        let versions: &[&str] = if u2f {
            &["U2F_V2", "FIDO_2_0"]
        } else {
            &["FIDO_2_0"]
        };
        ctap2_authenticator(versions, &options)
    }

    #[test]
    fn make_credential_pin_disposition_table() {
        use MakeCredentialPinDisposition::*;
        use UserVerificationRequirement::*;

        let with_pin = PinObserver(true);
        let without_pin = PinObserver(false);

        // (clientPin, uv option, u2f fallback, requirement, observer, expected)
        let cases: Vec<(
            Option<bool>,
            Option<bool>,
            bool,
            UserVerificationRequirement,
            Option<&dyn Observer>,
            MakeCredentialPinDisposition,
        )> = vec![
            // Built-in UV wins over everything.
            (Some(true), Some(true), false, Required, None, NoPin),
            // PIN set, no U2F fallback: PIN is mandatory.
            (Some(true), None, false, Discouraged, Some(&with_pin), UsePin),
            (Some(true), None, false, Discouraged, Some(&without_pin), Unsatisfiable),
            (Some(true), None, false, Discouraged, None, Unsatisfiable),
            // UV required but no way to collect a PIN.
            (None, None, false, Required, Some(&with_pin), Unsatisfiable),
            (Some(false), None, false, Required, Some(&without_pin), Unsatisfiable),
            (Some(false), None, false, Required, None, Unsatisfiable),
            // UV required and a PIN can be set on the fly.
            (Some(false), None, false, Required, Some(&with_pin), SetPin),
            // Discouraged rides the U2F fallback even with a PIN set.
            (Some(true), None, true, Discouraged, Some(&with_pin), NoPin),
            (Some(false), None, false, Discouraged, Some(&with_pin), NoPin),
            // Preferred uses the PIN when it is set and collectible.
            (Some(true), None, true, Preferred, Some(&with_pin), UsePin),
            (Some(true), None, true, Preferred, Some(&without_pin), NoPin),
            (Some(false), None, false, Preferred, Some(&with_pin), NoPin),
            (None, None, false, Preferred, Some(&with_pin), NoPin),
        ];

        for (i, (client_pin, uv, u2f, requirement, observer, expected)) in
            cases.into_iter().enumerate()
        {
            let authenticator = disposition_fixture(client_pin, uv, u2f);
            let request = sample_make_credential(requirement);
            assert_eq!(
                authenticator.will_need_pin_to_make_credential(&request, observer),
                expected,
                "case {} failed",
                i
            );
        }
    }

    #[test]
    fn get_assertion_pin_disposition_table() {
        use GetAssertionPinDisposition::*;
        use UserVerificationRequirement::*;

        let with_pin = PinObserver(true);
        let without_pin = PinObserver(false);
        let handle = || vec![PublicKeyCredentialDescriptor::new(vec![0x01; 8])];

        let cases: Vec<(
            Option<bool>,
            Option<bool>,
            UserVerificationRequirement,
            Vec<PublicKeyCredentialDescriptor>,
            Option<&dyn Observer>,
            GetAssertionPinDisposition,
        )> = vec![
            // Built-in UV wins.
            (Some(true), Some(true), Required, Vec::new(), None, NoPin),
            // Resident-key requests demand a usable PIN.
            (Some(true), None, Discouraged, Vec::new(), Some(&with_pin), UsePin),
            (Some(true), None, Discouraged, Vec::new(), Some(&without_pin), Unsatisfiable),
            (Some(false), None, Discouraged, Vec::new(), Some(&with_pin), Unsatisfiable),
            (None, None, Discouraged, Vec::new(), None, Unsatisfiable),
            // UV required follows the same rule over the allow list.
            (Some(true), None, Required, handle(), Some(&with_pin), UsePin),
            (Some(true), None, Required, handle(), Some(&without_pin), Unsatisfiable),
            (None, None, Required, handle(), Some(&with_pin), Unsatisfiable),
            // Preferred uses a usable PIN, otherwise none.
            (Some(true), None, Preferred, handle(), Some(&with_pin), UsePin),
            (Some(true), None, Preferred, handle(), Some(&without_pin), NoPin),
            (Some(false), None, Preferred, handle(), Some(&with_pin), NoPin),
            (Some(true), None, Discouraged, handle(), Some(&with_pin), NoPin),
        ];

        for (i, (client_pin, uv, requirement, allow_list, observer, expected)) in
            cases.into_iter().enumerate()
        {
            let authenticator = disposition_fixture(client_pin, uv, false);
            let request = sample_get_assertion(requirement, allow_list);
            assert_eq!(
                authenticator.will_need_pin_to_get_assertion(&request, observer),
                expected,
                "case {} failed",
                i
            );
        }
    }
}
