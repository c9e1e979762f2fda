/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Tasks wrap MakeCredential and GetAssertion. On CTAP2 they are a single
//! request/response exchange; on U2F they run the multi-exchange APDU
//! protocol (user-presence polling, key-handle probing) behind the same
//! completion callback, so the facade never sees the difference.

use crate::apdu::{split_response, ApduErrorStatus};
use crate::authenticator::{GetAssertionCallback, MakeCredentialCallback};
use crate::ctap2::commands::get_assertion::GetAssertion;
use crate::ctap2::commands::make_credentials::MakeCredentials;
use crate::ctap2::commands::{repair_invalid_utf8, StatusCode};
use crate::operation;
use crate::transport::errors::TransportError;
use crate::transport::{FidoDevice, ProtocolVersion};

pub(crate) enum TaskStep {
    Continue,
    Finished,
}

pub(crate) trait FidoTask<D: FidoDevice> {
    fn start(&mut self, device: &mut D) -> TaskStep;

    fn on_device_response(
        &mut self,
        device: &mut D,
        result: Result<Vec<u8>, TransportError>,
    ) -> TaskStep;
}

fn send_or_fail<D: FidoDevice>(device: &mut D, frame: &[u8]) -> Result<(), StatusCode> {
    device.send(frame).map_err(|e| {
        warn!("device send failed: {}", e);
        StatusCode::DeviceError
    })
}

pub(crate) struct MakeCredentialTask {
    request: MakeCredentials,
    protocol: ProtocolVersion,
    callback: Option<MakeCredentialCallback>,
}

impl MakeCredentialTask {
    pub(crate) fn new(
        request: MakeCredentials,
        protocol: ProtocolVersion,
        callback: MakeCredentialCallback,
    ) -> Self {
        MakeCredentialTask {
            request,
            protocol,
            callback: Some(callback),
        }
    }

    fn finish(
        &mut self,
        status: StatusCode,
        response: Option<crate::ctap2::attestation::AttestationObject>,
    ) -> TaskStep {
        if let Some(callback) = self.callback.take() {
            callback(status, response);
        }
        TaskStep::Finished
    }
}

impl<D: FidoDevice> FidoTask<D> for MakeCredentialTask {
    fn start(&mut self, device: &mut D) -> TaskStep {
        let frame = match self.protocol {
            ProtocolVersion::Ctap2 => match operation::encode_request(&self.request) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("failed to encode MakeCredentials: {}", e);
                    return self.finish(StatusCode::Other, None);
                }
            },
            ProtocolVersion::U2f => self.request.u2f_frame(),
        };
        match send_or_fail(device, &frame) {
            Ok(()) => TaskStep::Continue,
            Err(status) => self.finish(status, None),
        }
    }

    fn on_device_response(
        &mut self,
        device: &mut D,
        result: Result<Vec<u8>, TransportError>,
    ) -> TaskStep {
        match self.protocol {
            ProtocolVersion::Ctap2 => {
                let (status, response) = operation::decode_response(&self.request, None, result);
                self.finish(status, response)
            }
            ProtocolVersion::U2f => {
                let bytes = match result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("device transfer failed: {}", e);
                        return self.finish(StatusCode::DeviceError, None);
                    }
                };
                let (payload, status_word) = match split_response(&bytes) {
                    Ok(split) => split,
                    Err(_) => return self.finish(StatusCode::DeviceError, None),
                };
                match ApduErrorStatus::from_status(status_word) {
                    Ok(()) => {
                        let response = self.request.parse_u2f_response(payload).ok();
                        self.finish(StatusCode::OK, response)
                    }
                    // The token answers this until it has seen a touch.
                    Err(ApduErrorStatus::ConditionsNotSatisfied) => {
                        let frame = self.request.u2f_frame();
                        match send_or_fail(device, &frame) {
                            Ok(()) => TaskStep::Continue,
                            Err(status) => self.finish(status, None),
                        }
                    }
                    Err(other) => {
                        debug!("U2F register failed: {:?}", other);
                        self.finish(StatusCode::Other, None)
                    }
                }
            }
        }
    }
}

enum U2fSignState {
    /// Probing allow-list entries with check-only requests.
    Checking(usize),
    /// Waiting for a real signature over the accepted key handle.
    Signing(usize),
}

pub(crate) struct GetAssertionTask {
    request: GetAssertion,
    protocol: ProtocolVersion,
    state: U2fSignState,
    callback: Option<GetAssertionCallback>,
}

impl GetAssertionTask {
    pub(crate) fn new(
        request: GetAssertion,
        protocol: ProtocolVersion,
        callback: GetAssertionCallback,
    ) -> Self {
        GetAssertionTask {
            request,
            protocol,
            state: U2fSignState::Checking(0),
            callback: Some(callback),
        }
    }

    fn finish(
        &mut self,
        status: StatusCode,
        response: Option<crate::ctap2::commands::get_assertion::GetAssertionResponse>,
    ) -> TaskStep {
        if let Some(callback) = self.callback.take() {
            callback(status, response);
        }
        TaskStep::Finished
    }

    /// Probe allow-list entry `index`, or give up when the list is spent.
    fn check_handle<D: FidoDevice>(&mut self, device: &mut D, index: usize) -> TaskStep {
        if index >= self.request.allow_list.len() {
            return self.finish(StatusCode::NoCredentials, None);
        }
        let frame = {
            let key_handle = &self.request.allow_list[index].id;
            self.request.u2f_check_frame(key_handle)
        };
        self.state = U2fSignState::Checking(index);
        match send_or_fail(device, &frame) {
            Ok(()) => TaskStep::Continue,
            Err(status) => self.finish(status, None),
        }
    }

    fn sign_with_handle<D: FidoDevice>(&mut self, device: &mut D, index: usize) -> TaskStep {
        let frame = {
            let key_handle = &self.request.allow_list[index].id;
            self.request.u2f_sign_frame(key_handle)
        };
        self.state = U2fSignState::Signing(index);
        match send_or_fail(device, &frame) {
            Ok(()) => TaskStep::Continue,
            Err(status) => self.finish(status, None),
        }
    }
}

impl<D: FidoDevice> FidoTask<D> for GetAssertionTask {
    fn start(&mut self, device: &mut D) -> TaskStep {
        match self.protocol {
            ProtocolVersion::Ctap2 => {
                let frame = match operation::encode_request(&self.request) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("failed to encode GetAssertion: {}", e);
                        return self.finish(StatusCode::Other, None);
                    }
                };
                match send_or_fail(device, &frame) {
                    Ok(()) => TaskStep::Continue,
                    Err(status) => self.finish(status, None),
                }
            }
            // Resident credentials need CTAP2; over U2F every assertion goes
            // through the allow list.
            ProtocolVersion::U2f => self.check_handle(device, 0),
        }
    }

    fn on_device_response(
        &mut self,
        device: &mut D,
        result: Result<Vec<u8>, TransportError>,
    ) -> TaskStep {
        if let ProtocolVersion::Ctap2 = self.protocol {
            let (status, response) =
                operation::decode_response(&self.request, Some(repair_invalid_utf8), result);
            return self.finish(status, response);
        }

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("device transfer failed: {}", e);
                return self.finish(StatusCode::DeviceError, None);
            }
        };
        let (payload, status_word) = match split_response(&bytes) {
            Ok(split) => split,
            Err(_) => return self.finish(StatusCode::DeviceError, None),
        };
        let status = ApduErrorStatus::from_status(status_word);

        match self.state {
            U2fSignState::Checking(index) => match status {
                // A check-only request against a valid handle "fails" with
                // conditions-not-satisfied; a plain OK means the same thing.
                Ok(()) | Err(ApduErrorStatus::ConditionsNotSatisfied) => {
                    self.sign_with_handle(device, index)
                }
                Err(_) => self.check_handle(device, index + 1),
            },
            U2fSignState::Signing(index) => match status {
                Ok(()) => {
                    let key_handle = self.request.allow_list[index].id.clone();
                    let response = self.request.parse_u2f_response(&key_handle, payload).ok();
                    self.finish(StatusCode::OK, response)
                }
                Err(ApduErrorStatus::ConditionsNotSatisfied) => {
                    // Still waiting for the touch.
                    let frame = {
                        let key_handle = &self.request.allow_list[index].id;
                        self.request.u2f_sign_frame(key_handle)
                    };
                    match send_or_fail(device, &frame) {
                        Ok(()) => TaskStep::Continue,
                        Err(status) => self.finish(status, None),
                    }
                }
                Err(other) => {
                    debug!("U2F sign failed: {:?}", other);
                    self.finish(StatusCode::Other, None)
                }
            },
        }
    }
}
