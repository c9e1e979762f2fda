/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::error::Error as StdErrorT;
use std::fmt;
use std::io;

/// Failures of the underlying device channel. These are distinct from CTAP2
/// status codes: the device never saw or never answered the request.
#[derive(Debug)]
pub enum TransportError {
    /// The device went away (unplugged, powered down, session closed).
    Disconnected,
    /// The transfer was cancelled before a response arrived.
    Cancelled,
    /// The channel delivered something that is not a well-formed message.
    InvalidFraming,
    IO(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TransportError::Disconnected => write!(f, "TransportError: device disconnected"),
            TransportError::Cancelled => write!(f, "TransportError: transfer cancelled"),
            TransportError::InvalidFraming => write!(f, "TransportError: invalid framing"),
            TransportError::IO(ref e) => write!(f, "TransportError: I/O error: {}", e),
        }
    }
}

impl StdErrorT for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::IO(e)
    }
}
