/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::transport::errors::TransportError;
use crate::transport::{Capability, FidoDevice};
use std::collections::VecDeque;

/// Scripted in-memory device for unit tests.
///
/// Expected requests are registered with `add_write` and checked
/// byte-for-byte as the driver sends; replies registered with `add_read`
/// (or `add_error`) become available through `take_reply` one send at a
/// time. A send with no scripted reply stays in flight until the test
/// delivers something itself, which is how the single-outstanding-operation
/// invariant gets exercised.
pub struct TestDevice {
    caps: Capability,
    expected_writes: VecDeque<Vec<u8>>,
    scripted_replies: VecDeque<Result<Vec<u8>, TransportError>>,
    pending_reply: Option<Result<Vec<u8>, TransportError>>,
    pub requests: Vec<Vec<u8>>,
    pub cancels: usize,
}

impl TestDevice {
    pub fn ctap2() -> Self {
        Self::with_capabilities(Capability::CBOR)
    }

    pub fn u2f() -> Self {
        Self::with_capabilities(Capability::empty())
    }

    pub fn with_capabilities(caps: Capability) -> Self {
        TestDevice {
            caps,
            expected_writes: VecDeque::new(),
            scripted_replies: VecDeque::new(),
            pending_reply: None,
            requests: Vec::new(),
            cancels: 0,
        }
    }

    pub fn add_write(&mut self, expected: &[u8]) {
        self.expected_writes.push_back(expected.to_vec());
    }

    pub fn add_read(&mut self, reply: &[u8]) {
        self.scripted_replies.push_back(Ok(reply.to_vec()));
    }

    pub fn add_error(&mut self, error: TransportError) {
        self.scripted_replies.push_back(Err(error));
    }

    /// The reply for the most recent send, if one was scripted.
    pub fn take_reply(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.pending_reply.take()
    }

    pub fn last_request(&self) -> &[u8] {
        self.requests.last().expect("no request was sent")
    }

    pub fn all_scripts_consumed(&self) -> bool {
        self.expected_writes.is_empty() && self.scripted_replies.is_empty()
    }
}

impl FidoDevice for TestDevice {
    fn id(&self) -> String {
        "TestDevice".to_string()
    }

    fn capabilities(&self) -> Capability {
        self.caps
    }

    fn send(&mut self, request: &[u8]) -> Result<(), TransportError> {
        assert!(
            self.pending_reply.is_none(),
            "TestDevice: send while a transfer is still in flight"
        );
        if let Some(expected) = self.expected_writes.pop_front() {
            assert_eq!(
                &expected[..],
                request,
                "TestDevice: unexpected request bytes"
            );
        }
        self.requests.push(request.to_vec());
        self.pending_reply = self.scripted_replies.pop_front();
        Ok(())
    }

    fn cancel(&mut self) {
        self.cancels += 1;
    }
}
