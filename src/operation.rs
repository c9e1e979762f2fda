/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The single-shot CTAP2 operation: request out, one reply back, typed
//! result delivered. The authenticator holds at most one of these at a time
//! and takes it out of its slot before the completion body runs, so a fresh
//! operation can be started from within any completion callback.

use crate::authenticator::FidoDeviceAuthenticator;
use crate::ctap2::commands::{CommandError, RequestCtap2, StatusCode, Utf8FixupFn};
use crate::transport::errors::TransportError;
use crate::transport::FidoDevice;

type Completion<D> =
    Box<dyn FnOnce(&mut FidoDeviceAuthenticator<D>, Result<Vec<u8>, TransportError>)>;

pub(crate) struct PendingOperation<D: FidoDevice + 'static> {
    complete: Completion<D>,
}

impl<D: FidoDevice + 'static> PendingOperation<D> {
    pub(crate) fn new<Req, F>(request: Req, fixup: Option<Utf8FixupFn>, on_done: F) -> Self
    where
        Req: RequestCtap2 + 'static,
        F: FnOnce(&mut FidoDeviceAuthenticator<D>, StatusCode, Option<Req::Output>) + 'static,
    {
        PendingOperation {
            complete: Box::new(move |authenticator, result| {
                let (status, response) = decode_response(&request, fixup, result);
                on_done(authenticator, status, response);
            }),
        }
    }

    pub(crate) fn complete(
        self,
        authenticator: &mut FidoDeviceAuthenticator<D>,
        result: Result<Vec<u8>, TransportError>,
    ) {
        (self.complete)(authenticator, result);
    }
}

/// CTAP2 frame: command byte followed by the CBOR parameter map.
pub(crate) fn encode_request<Req: RequestCtap2>(request: &Req) -> Result<Vec<u8>, CommandError> {
    let mut frame = vec![request.command() as u8];
    frame.extend(request.wire_format()?);
    Ok(frame)
}

/// Split the status byte off a raw reply and parse the body. A body that
/// fails to parse yields the status it arrived with and no response; the
/// caller decides what that means.
pub(crate) fn decode_response<Req: RequestCtap2>(
    request: &Req,
    fixup: Option<Utf8FixupFn>,
    result: Result<Vec<u8>, TransportError>,
) -> (StatusCode, Option<Req::Output>) {
    let bytes = match result {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("device transfer failed: {}", e);
            return (StatusCode::DeviceError, None);
        }
    };
    if bytes.is_empty() {
        warn!("device reply carried no status byte");
        return (StatusCode::DeviceError, None);
    }

    let status = StatusCode::from(bytes[0]);
    debug!("response status code: {:?}", status);
    if !status.is_ok() {
        return (status, None);
    }

    let body = &bytes[1..];
    let repaired;
    let body = match fixup.and_then(|fix| fix(body)) {
        Some(fixed) => {
            repaired = fixed;
            &repaired[..]
        }
        None => body,
    };

    match request.parse_response(body) {
        Ok(response) => (status, Some(response)),
        Err(e) => {
            debug!("failed to parse response: {}", e);
            (status, None)
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::ctap2::commands::client_pin::RetriesRequest;
    use crate::ctap2::commands::repair_invalid_utf8;
    use crate::ctap2::commands::Command;

    #[test]
    fn frames_start_with_the_command_byte() {
        let frame = encode_request(&RetriesRequest::default()).unwrap();
        assert_eq!(frame[0], Command::ClientPin as u8);
        assert_eq!(&frame[1..], &[0xA2, 0x01, 0x01, 0x02, 0x01]);
    }

    #[test]
    fn transport_errors_become_device_error() {
        let (status, response) = decode_response(
            &RetriesRequest::default(),
            None,
            Err(TransportError::Disconnected),
        );
        assert_eq!(status, StatusCode::DeviceError);
        assert!(response.is_none());
        let (status, response) = decode_response(&RetriesRequest::default(), None, Ok(Vec::new()));
        assert_eq!(status, StatusCode::DeviceError);
        assert!(response.is_none());
    }

    #[test]
    fn error_status_suppresses_parsing() {
        let (status, response) =
            decode_response(&RetriesRequest::default(), None, Ok(vec![0x31]));
        assert_eq!(status, StatusCode::PinInvalid);
        assert!(response.is_none());
    }

    #[test]
    fn unparseable_body_keeps_the_ok_status() {
        let (status, response) =
            decode_response(&RetriesRequest::default(), None, Ok(vec![0x00, 0xFF]));
        assert_eq!(status, StatusCode::OK);
        assert!(response.is_none());
    }

    #[test]
    fn fixup_applies_before_parsing() {
        // {3: 8} with a second, invalid-UTF-8 text entry would fail without
        // repair; repaired it parses and the retries come through.
        let body = vec![0x00, 0xA2, 0x03, 0x08, 0x04, 0x62, 0x61, 0xC3];
        let (status, response) = decode_response(
            &RetriesRequest::default(),
            Some(repair_invalid_utf8),
            Ok(body),
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.unwrap().pin_retries, 8);
    }
}
