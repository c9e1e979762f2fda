/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::get_assertion::GetAssertionResponse;
use super::{Command, CommandError, RequestCtap2};
use serde_cbor::de::from_slice;

/// Fetches the next assertion after a GetAssertion that reported
/// `number_of_credentials > 1`. No parameters; must follow immediately on
/// the same device or the authenticator answers NotAllowed.
#[derive(Debug, Default)]
pub struct GetNextAssertion;

impl RequestCtap2 for GetNextAssertion {
    type Output = GetAssertionResponse;

    fn command(&self) -> Command {
        Command::GetNextAssertion
    }

    fn wire_format(&self) -> Result<Vec<u8>, CommandError> {
        Ok(Vec::new())
    }

    fn parse_response(&self, body: &[u8]) -> Result<Self::Output, CommandError> {
        if body.is_empty() {
            return Err(CommandError::InputTooSmall);
        }
        from_slice(body).map_err(CommandError::Deserializing)
    }
}
