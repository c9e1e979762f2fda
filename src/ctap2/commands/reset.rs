/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::client_pin::EmptyResponse;
use super::{Command, CommandError, RequestCtap2};

/// authenticatorReset wipes every credential and the PIN. Most devices only
/// accept it within a few seconds of power-up and after a touch.
#[derive(Debug, Default)]
pub struct ResetRequest;

pub type ResetResponse = EmptyResponse;

impl RequestCtap2 for ResetRequest {
    type Output = ResetResponse;

    fn command(&self) -> Command {
        Command::Reset
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        Ok(Vec::new())
    }

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        if body.is_empty() {
            Ok(EmptyResponse {})
        } else {
            Err(CommandError::UnexpectedField("non-empty response body"))
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn reset_is_parameterless() {
        let request = ResetRequest::default();
        assert_eq!(request.command(), Command::Reset);
        assert!(request.wire_format().unwrap().is_empty());
        assert!(request.parse_response(&[]).is_ok());
        assert!(request.parse_response(&[0x00]).is_err());
    }
}
