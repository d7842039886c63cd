// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Interactive verification of devices and users.
//!
//! A verification starts with a [`VerificationRequest`], once both sides
//! agreed on a method the request branches off into a method specific flow,
//! currently only the emoji/decimal short auth string flow, [`SasVerifier`].

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use eyeball::{ObservableWriteGuard, SharedObservable, Subscriber};
use matrix_client_common::AsyncTraitDeps;
use ruma::{
    events::key::verification::{cancel::CancelCode, VerificationMethod},
    OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId, TransactionId,
};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use crate::{
    error::OutgoingRequestError,
    requests::{OutgoingVerificationRequest, RoomMessageRequest, ToDeviceRequest, ALL_DEVICES},
};

mod requests;
mod sas;

pub use requests::VerificationRequest;
pub use sas::{Emoji, SasEngine, SasState, SasVerifier, VerificationEngine};

/// How long a verification flow stays valid.
pub const VERIFICATION_TIMEOUT: Duration = Duration::from_secs(60 * 10);

/// The verification methods we support.
pub const SUPPORTED_METHODS: &[VerificationMethod] = &[VerificationMethod::SasV1];

/// Sends the messages of a verification flow.
#[async_trait]
pub trait VerificationTransport: AsyncTraitDeps {
    /// Send a to-device or room message, returning the JSON response.
    async fn send_verification_request(
        &self,
        request: OutgoingVerificationRequest,
    ) -> Result<JsonValue, OutgoingRequestError>;
}

/// An enum over the different verification flow ids.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum FlowId {
    /// The flow id of a to-device verification, the transaction id of the
    /// request.
    ToDevice(OwnedTransactionId),
    /// The flow id of an in-room verification, the room and the event id of
    /// the `m.key.verification.request` message.
    InRoom(OwnedRoomId, OwnedEventId),
}

impl FlowId {
    /// Get the string form of the flow id.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ToDevice(t) => t.as_str(),
            Self::InRoom(_, e) => e.as_str(),
        }
    }
}

/// Information about the cancellation of a verification request or
/// verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
    reason: String,
}

impl CancelInfo {
    pub(crate) fn new(cancelled_by_us: bool, cancel_code: CancelCode) -> Self {
        let reason = match &cancel_code {
            CancelCode::Accepted => {
                "A m.key.verification.request was accepted by a different device."
            }
            CancelCode::InvalidMessage => "The received message was invalid.",
            CancelCode::KeyMismatch => "The expected key did not match the verified one",
            CancelCode::MismatchedSas => "The short authentication string did not match.",
            CancelCode::Timeout => "The verification process timed out.",
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method."
            }
            CancelCode::UnknownTransaction => {
                "The device does not know about the given transaction ID."
            }
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::UserMismatch => "The expected user did not match the verified user",
            _ => "Unknown cancel reason",
        };

        Self { cancelled_by_us, cancel_code, reason: reason.to_owned() }
    }

    fn from_remote(cancel_code: CancelCode, reason: String) -> Self {
        Self { cancelled_by_us: false, cancel_code, reason }
    }

    /// Get the human readable reason of the cancellation.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the `CancelCode` that cancelled this verification.
    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    /// Was the verification cancelled by us?
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }
}

/// The phase of a verification request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationPhase {
    /// The request was sent or received, waiting for the other side to be
    /// ready.
    Requested,
    /// Both sides are ready, a method can be started.
    Ready {
        /// The methods the other side supports.
        their_methods: Vec<VerificationMethod>,
        /// The methods we support.
        our_methods: Vec<VerificationMethod>,
    },
    /// A verification method was started.
    Started {
        /// The method that was started.
        method: VerificationMethod,
    },
    /// The verification finished successfully.
    Done,
    /// The verification was cancelled.
    Cancelled(CancelInfo),
}

impl VerificationPhase {
    /// Is this a phase the verification can't leave anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled(_))
    }
}

/// Error type for the verification flows.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// The operation isn't allowed in the current phase.
    #[error("the operation isn't allowed in the phase {phase:?}, expected {expected}")]
    InvalidPhase {
        /// The phase the operation requires.
        expected: &'static str,
        /// The phase the verification is in.
        phase: Box<VerificationPhase>,
    },

    /// We can't accept a request we sent ourselves.
    #[error("can't accept a verification request we started")]
    OwnRequest,

    /// The other side doesn't support any of our methods.
    #[error("the other side doesn't support the {0} method")]
    UnsupportedMethod(VerificationMethod),

    /// A received verification message is malformed.
    #[error("invalid verification message: {0}")]
    InvalidMessage(String),

    /// A received request is too old, or claims to come from the future.
    #[error("the verification request isn't fresh")]
    StaleRequest,

    /// The operation isn't allowed in the current state of the SAS flow.
    #[error("the operation isn't allowed in the SAS state {state:?}, expected {expected}")]
    InvalidSasState {
        /// The state the operation requires.
        expected: &'static str,
        /// The state the flow is in.
        state: Box<SasState>,
    },

    /// Sending a message failed.
    #[error(transparent)]
    Transport(#[from] OutgoingRequestError),
}

/// A verification message received from the other side.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum VerificationContent {
    Request {
        from_device: OwnedDeviceId,
        methods: Vec<VerificationMethod>,
        timestamp: Option<u64>,
    },
    Ready { from_device: OwnedDeviceId, methods: Vec<VerificationMethod> },
    Start { from_device: OwnedDeviceId, method: VerificationMethod, content: JsonValue },
    Accept(JsonValue),
    Key(JsonValue),
    Mac(JsonValue),
    Cancel { code: CancelCode, reason: String },
    Done,
}

impl VerificationContent {
    /// Parse the content of a verification event.
    ///
    /// In-room requests are `m.room.message` events with a
    /// `m.key.verification.request` msgtype.
    pub(crate) fn parse(event_type: &str, content: &JsonValue) -> Result<Self, VerificationError> {
        let event_type = if event_type == "m.room.message" {
            content.get("msgtype").and_then(JsonValue::as_str).unwrap_or(event_type)
        } else {
            event_type
        };

        let invalid = |field: &str| VerificationError::InvalidMessage(format!("missing {field}"));

        let from_device = || -> Result<OwnedDeviceId, VerificationError> {
            content
                .get("from_device")
                .and_then(JsonValue::as_str)
                .map(Into::into)
                .ok_or_else(|| invalid("from_device"))
        };

        let methods = || -> Result<Vec<VerificationMethod>, VerificationError> {
            let methods = content.get("methods").cloned().ok_or_else(|| invalid("methods"))?;
            serde_json::from_value(methods)
                .map_err(|e| VerificationError::InvalidMessage(e.to_string()))
        };

        Ok(match event_type {
            "m.key.verification.request" => Self::Request {
                from_device: from_device()?,
                methods: methods()?,
                timestamp: content.get("timestamp").and_then(JsonValue::as_u64),
            },
            "m.key.verification.ready" => {
                Self::Ready { from_device: from_device()?, methods: methods()? }
            }
            "m.key.verification.start" => {
                let method = content
                    .get("method")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| invalid("method"))?;
                Self::Start {
                    from_device: from_device()?,
                    method: method.into(),
                    content: content.clone(),
                }
            }
            "m.key.verification.accept" => Self::Accept(content.clone()),
            "m.key.verification.key" => Self::Key(content.clone()),
            "m.key.verification.mac" => Self::Mac(content.clone()),
            "m.key.verification.cancel" => {
                let code =
                    content.get("code").and_then(JsonValue::as_str).ok_or_else(|| invalid("code"))?;
                let reason = content.get("reason").and_then(JsonValue::as_str).unwrap_or_default();
                Self::Cancel { code: code.into(), reason: reason.to_owned() }
            }
            "m.key.verification.done" => Self::Done,
            other => {
                return Err(VerificationError::InvalidMessage(format!(
                    "{other} isn't a verification event"
                )))
            }
        })
    }
}

/// The flow both a request and its verifier send their messages through.
///
/// Holds the phase of the request, so a verifier can conclude or cancel the
/// whole flow.
#[derive(Debug)]
pub(crate) struct VerificationFlow {
    flow_id: RwLock<Option<FlowId>>,
    other_user: OwnedUserId,
    other_device: RwLock<Option<OwnedDeviceId>>,
    transport: Arc<dyn VerificationTransport>,
    phase: SharedObservable<VerificationPhase>,
    cancel_sent: OnceCell<()>,
}

impl VerificationFlow {
    pub(crate) fn new(
        flow_id: Option<FlowId>,
        other_user: OwnedUserId,
        other_device: Option<OwnedDeviceId>,
        transport: Arc<dyn VerificationTransport>,
    ) -> Self {
        Self {
            flow_id: RwLock::new(flow_id),
            other_user,
            other_device: RwLock::new(other_device),
            transport,
            phase: SharedObservable::new(VerificationPhase::Requested),
            cancel_sent: OnceCell::new(),
        }
    }

    pub(crate) fn flow_id(&self) -> Option<FlowId> {
        self.flow_id.read().unwrap().clone()
    }

    pub(crate) fn set_flow_id(&self, flow_id: FlowId) {
        *self.flow_id.write().unwrap() = Some(flow_id);
    }

    pub(crate) fn other_user(&self) -> &OwnedUserId {
        &self.other_user
    }

    pub(crate) fn other_device(&self) -> Option<OwnedDeviceId> {
        self.other_device.read().unwrap().clone()
    }

    pub(crate) fn set_other_device(&self, device: OwnedDeviceId) {
        *self.other_device.write().unwrap() = Some(device);
    }

    pub(crate) fn phase(&self) -> VerificationPhase {
        self.phase.get()
    }

    pub(crate) fn subscribe(&self) -> Subscriber<VerificationPhase> {
        self.phase.subscribe()
    }

    /// Move to a new phase unless the flow already ended.
    pub(crate) fn set_phase(&self, phase: VerificationPhase) -> bool {
        let mut guard = self.phase.write();
        if guard.is_terminal() {
            return false;
        }

        trace!(?phase, "Verification phase changed");
        ObservableWriteGuard::set(&mut guard, phase);
        true
    }

    /// Send a message of the flow, tagged with the flow id.
    pub(crate) async fn send(
        &self,
        event_type: &str,
        mut content: JsonValue,
    ) -> Result<JsonValue, VerificationError> {
        let flow_id = self.flow_id();

        let request = match &flow_id {
            Some(FlowId::ToDevice(txn_id)) => {
                content["transaction_id"] = txn_id.as_str().into();
                self.to_device_request(event_type, content)
            }
            Some(FlowId::InRoom(room_id, event_id)) => {
                content["m.relates_to"] = json!({
                    "rel_type": "m.reference",
                    "event_id": event_id,
                });
                OutgoingVerificationRequest::InRoom(RoomMessageRequest {
                    room_id: room_id.clone(),
                    txn_id: TransactionId::new(),
                    event_type: event_type.to_owned(),
                    content,
                })
            }
            None => {
                return Err(VerificationError::InvalidMessage("the flow has no id yet".to_owned()))
            }
        };

        Ok(self.transport.send_verification_request(request).await?)
    }

    /// Send a message without touching its content, used for the initial
    /// request of a flow.
    pub(crate) async fn send_raw(
        &self,
        request: OutgoingVerificationRequest,
    ) -> Result<JsonValue, VerificationError> {
        Ok(self.transport.send_verification_request(request).await?)
    }

    pub(crate) fn to_device_request(
        &self,
        event_type: &str,
        content: JsonValue,
    ) -> OutgoingVerificationRequest {
        let device = self.other_device();
        let device = device.as_ref().map(|d| d.as_str()).unwrap_or(ALL_DEVICES);

        OutgoingVerificationRequest::ToDevice(ToDeviceRequest::new(
            &self.other_user,
            Some(device),
            event_type,
            content,
        ))
    }

    /// Cancel the flow.
    ///
    /// The phase changes to cancelled right away, concurrent calls share a
    /// single cancellation message. Sending the message is best effort, the
    /// other side might have concluded the flow already.
    pub(crate) async fn cancel(&self, code: CancelCode) -> Result<(), VerificationError> {
        {
            let mut guard = self.phase.write();
            let current = (*guard).clone();

            match current {
                VerificationPhase::Done => {
                    return Err(VerificationError::InvalidPhase {
                        expected: "a non-terminal phase",
                        phase: Box::new(VerificationPhase::Done),
                    });
                }
                VerificationPhase::Cancelled(info) if !info.cancelled_by_us() => return Ok(()),
                VerificationPhase::Cancelled(_) => {}
                _ => {
                    debug!(?code, "Cancelling the verification");
                    let info = CancelInfo::new(true, code);
                    ObservableWriteGuard::set(&mut guard, VerificationPhase::Cancelled(info));
                }
            }
        }

        let VerificationPhase::Cancelled(info) = self.phase() else {
            return Ok(());
        };

        self.cancel_sent
            .get_or_init(|| async {
                let content = json!({
                    "code": info.cancel_code().as_str(),
                    "reason": info.reason(),
                });

                if let Err(e) = self.send("m.key.verification.cancel", content).await {
                    warn!("Failed to send the verification cancellation: {e}");
                }
            })
            .await;

        Ok(())
    }

    /// Handle a cancellation sent by the other side.
    pub(crate) fn receive_cancel(&self, code: CancelCode, reason: String) {
        debug!(?code, reason, "The other side cancelled the verification");
        self.set_phase(VerificationPhase::Cancelled(CancelInfo::from_remote(code, reason)));
    }
}
