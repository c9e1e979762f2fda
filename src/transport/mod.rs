/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub mod errors;
#[cfg(test)]
pub(crate) mod test;

use crate::transport::errors::TransportError;
use bitflags::bitflags;

bitflags! {
    /// Capability flags reported by the channel during its own init
    /// handshake. CBOR means the device understands CTAP2 frames; NMSG means
    /// it refuses raw U2F messages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u8 {
        const WINK = 0x01;
        const CBOR = 0x04;
        const NMSG = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    U2f,
    Ctap2,
}

/// One physical or platform authenticator channel, already framed: this
/// crate hands it fully encoded CTAP2 frames (command byte plus CBOR) or
/// U2F APDUs and treats everything below that as opaque.
///
/// `send` only initiates the transfer. The embedder forwards the device's
/// eventual reply (or failure) to
/// [`FidoDeviceAuthenticator::handle_device_response`], which keeps the
/// driver single-sequenced: there is never more than one transfer in flight
/// per device.
///
/// [`FidoDeviceAuthenticator::handle_device_response`]:
/// crate::FidoDeviceAuthenticator::handle_device_response
pub trait FidoDevice {
    fn id(&self) -> String;

    /// Capabilities learned during channel setup.
    fn capabilities(&self) -> Capability;

    /// Begin transmitting one request.
    fn send(&mut self, request: &[u8]) -> Result<(), TransportError>;

    /// Ask the device to abandon the outstanding transfer. Cooperative: the
    /// reply (often a keepalive-cancel status) still arrives through the
    /// normal completion path.
    fn cancel(&mut self);
}
