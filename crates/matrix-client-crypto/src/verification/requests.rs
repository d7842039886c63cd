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

use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use eyeball::Subscriber;
use matrix_client_common::{
    executor::{spawn, AbortOnDrop, JoinHandleExt},
    sleep::sleep,
};
use ruma::{
    events::key::verification::{cancel::CancelCode, VerificationMethod},
    MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedRoomId, OwnedUserId, TransactionId, UserId,
};
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{
    FlowId, SasVerifier, VerificationContent, VerificationEngine, VerificationError,
    VerificationFlow, VerificationPhase, VerificationTransport, SUPPORTED_METHODS,
    VERIFICATION_TIMEOUT,
};
use crate::requests::{OutgoingVerificationRequest, RoomMessageRequest};

/// How far in the future the timestamp of a request may be.
const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct RequestInner {
    flow: Arc<VerificationFlow>,
    own_user: OwnedUserId,
    own_device: OwnedDeviceId,
    we_started: bool,
    engine: Arc<dyn VerificationEngine>,
    /// When the request times out, incoming requests inherit the age of the
    /// request event.
    deadline: Instant,
    verifier: Mutex<Option<SasVerifier>>,
    timeout: Mutex<Option<AbortOnDrop<()>>>,
}

/// An object controlling key verification requests.
///
/// Interactive verification flows usually start with a verification request,
/// this object lets you send and reply to such a verification request.
///
/// After the initial handshake the verification flow transitions into the
/// SAS flow, available through [`VerificationRequest::verifier`].
#[derive(Clone, Debug)]
pub struct VerificationRequest {
    inner: Arc<RequestInner>,
}

impl VerificationRequest {
    fn new(
        flow: VerificationFlow,
        own_user: OwnedUserId,
        own_device: OwnedDeviceId,
        we_started: bool,
        engine: Arc<dyn VerificationEngine>,
        lifetime: Duration,
    ) -> Self {
        let inner = Arc::new(RequestInner {
            flow: Arc::new(flow),
            own_user,
            own_device,
            we_started,
            engine,
            deadline: Instant::now() + lifetime,
            verifier: Mutex::new(None),
            timeout: Mutex::new(None),
        });

        let task = spawn(cancel_on_timeout(Arc::downgrade(&inner), lifetime)).abort_on_drop();
        *inner.timeout.lock().unwrap() = Some(task);

        Self { inner }
    }

    /// Send a verification request to the devices of a user.
    ///
    /// `other_device` limits the request to a single device, otherwise all
    /// devices of the user receive it.
    #[instrument(skip(transport, engine))]
    pub async fn start_to_device(
        transport: Arc<dyn VerificationTransport>,
        engine: Arc<dyn VerificationEngine>,
        own_user: OwnedUserId,
        own_device: OwnedDeviceId,
        other_user: OwnedUserId,
        other_device: Option<OwnedDeviceId>,
    ) -> Result<Self, VerificationError> {
        let txn_id = TransactionId::new();
        let flow = VerificationFlow::new(
            Some(FlowId::ToDevice(txn_id.clone())),
            other_user,
            other_device,
            transport,
        );

        let content = json!({
            "from_device": own_device,
            "methods": SUPPORTED_METHODS,
            "timestamp": MilliSecondsSinceUnixEpoch::now(),
            "transaction_id": txn_id,
        });
        let request = flow.to_device_request("m.key.verification.request", content);
        flow.send_raw(request).await?;

        Ok(Self::new(flow, own_user, own_device, true, engine, VERIFICATION_TIMEOUT))
    }

    /// Send a verification request to a user as a message in a DM room.
    ///
    /// The event id of the message becomes the flow id.
    #[instrument(skip(transport, engine))]
    pub async fn start_in_room(
        transport: Arc<dyn VerificationTransport>,
        engine: Arc<dyn VerificationEngine>,
        own_user: OwnedUserId,
        own_device: OwnedDeviceId,
        room_id: OwnedRoomId,
        other_user: OwnedUserId,
    ) -> Result<Self, VerificationError> {
        let flow = VerificationFlow::new(None, other_user.clone(), None, transport);

        let content = json!({
            "msgtype": "m.key.verification.request",
            "body": format!(
                "{own_user} is requesting to verify your key, but your client does not support \
                 in-chat key verification."
            ),
            "from_device": own_device,
            "methods": SUPPORTED_METHODS,
            "to": other_user,
        });
        let request = OutgoingVerificationRequest::InRoom(RoomMessageRequest {
            room_id: room_id.clone(),
            txn_id: TransactionId::new(),
            event_type: "m.room.message".to_owned(),
            content,
        });

        let response = flow.send_raw(request).await?;
        let event_id = response
            .get("event_id")
            .cloned()
            .and_then(|e| serde_json::from_value(e).ok())
            .ok_or_else(|| {
                VerificationError::InvalidMessage("the response has no event id".to_owned())
            })?;

        flow.set_flow_id(FlowId::InRoom(room_id, event_id));

        Ok(Self::new(flow, own_user, own_device, true, engine, VERIFICATION_TIMEOUT))
    }

    /// Create a request from a `m.key.verification.request` we received.
    ///
    /// `origin_server_ts` is the timestamp of the event for in-room requests,
    /// to-device requests carry their own timestamp. Requests older than the
    /// verification timeout, or too far in the future, are rejected.
    #[allow(clippy::too_many_arguments)]
    pub fn from_request_event(
        transport: Arc<dyn VerificationTransport>,
        engine: Arc<dyn VerificationEngine>,
        own_user: OwnedUserId,
        own_device: OwnedDeviceId,
        sender: &UserId,
        flow_id: FlowId,
        event_type: &str,
        content: &JsonValue,
        origin_server_ts: Option<MilliSecondsSinceUnixEpoch>,
    ) -> Result<Self, VerificationError> {
        let VerificationContent::Request { from_device, timestamp, .. } =
            VerificationContent::parse(event_type, content)?
        else {
            return Err(VerificationError::InvalidMessage(format!("{event_type} isn't a request")));
        };

        let timestamp = timestamp.or_else(|| origin_server_ts.map(|ts| ts.get().into()));
        let now = MilliSecondsSinceUnixEpoch::now().get().into();
        let lifetime = remaining_lifetime(timestamp, now)?;

        info!(
            %sender,
            device_id = %from_device,
            flow_id = flow_id.as_str(),
            "Received a verification request"
        );

        let flow =
            VerificationFlow::new(Some(flow_id), sender.to_owned(), Some(from_device), transport);

        Ok(Self::new(flow, own_user, own_device, false, engine, lifetime))
    }

    /// The id of the flow, `None` only while an in-room request is being
    /// sent.
    pub fn flow_id(&self) -> Option<FlowId> {
        self.inner.flow.flow_id()
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        &self.inner.own_user
    }

    /// The user we're verifying with.
    pub fn other_user_id(&self) -> &UserId {
        self.inner.flow.other_user()
    }

    /// The device of the other user, once known.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        self.inner.flow.other_device()
    }

    /// Is this a verification of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.inner.own_user == *self.inner.flow.other_user()
    }

    /// Did we send the request.
    pub fn we_started(&self) -> bool {
        self.inner.we_started
    }

    /// The current phase.
    pub fn phase(&self) -> VerificationPhase {
        self.inner.flow.phase()
    }

    /// Listen to phase changes.
    pub fn changes(&self) -> Subscriber<VerificationPhase> {
        self.inner.flow.subscribe()
    }

    /// Has the request been accepted by both sides.
    pub fn is_ready(&self) -> bool {
        matches!(self.phase(), VerificationPhase::Ready { .. })
    }

    /// Did the verification finish successfully.
    pub fn is_done(&self) -> bool {
        self.phase() == VerificationPhase::Done
    }

    /// Was the verification cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.phase(), VerificationPhase::Cancelled(_))
    }

    /// How long the request stays valid.
    pub fn time_remaining(&self) -> Duration {
        self.inner.deadline.saturating_duration_since(Instant::now())
    }

    /// Has the request timed out.
    pub fn timed_out(&self) -> bool {
        Instant::now() >= self.inner.deadline
    }

    /// The SAS flow, once one was started by either side.
    pub fn verifier(&self) -> Option<SasVerifier> {
        self.inner.verifier.lock().unwrap().clone()
    }

    /// Accept the request, telling the other side which methods we support.
    pub async fn accept(&self) -> Result<(), VerificationError> {
        if self.we_started() {
            return Err(VerificationError::OwnRequest);
        }

        let phase = self.phase();
        if phase != VerificationPhase::Requested {
            return Err(VerificationError::InvalidPhase {
                expected: "requested",
                phase: Box::new(phase),
            });
        }

        let content = json!({
            "from_device": self.inner.own_device,
            "methods": SUPPORTED_METHODS,
        });
        self.inner.flow.send("m.key.verification.ready", content).await?;

        self.inner.flow.set_phase(VerificationPhase::Ready {
            // The request doesn't tell us more than that the other side knows
            // about SAS, only methods we both support matter.
            their_methods: SUPPORTED_METHODS.to_vec(),
            our_methods: SUPPORTED_METHODS.to_vec(),
        });

        Ok(())
    }

    /// Start a SAS verification once the request is ready.
    pub async fn start_sas(&self) -> Result<SasVerifier, VerificationError> {
        let VerificationPhase::Ready { their_methods, .. } = self.phase() else {
            return Err(VerificationError::InvalidPhase {
                expected: "ready",
                phase: Box::new(self.phase()),
            });
        };

        if !their_methods.contains(&VerificationMethod::SasV1) {
            return Err(VerificationError::UnsupportedMethod(VerificationMethod::SasV1));
        }

        let engine = self.create_sas_engine();
        let verifier =
            SasVerifier::start(self.inner.flow.clone(), self.inner.own_device.clone(), engine)
                .await?;

        self.set_verifier(verifier.clone());

        Ok(verifier)
    }

    /// Cancel the request.
    ///
    /// Concurrent calls send a single cancellation. Cancelling an already
    /// cancelled request is a no-op.
    pub async fn cancel(&self) -> Result<(), VerificationError> {
        self.cancel_with_code(CancelCode::User).await
    }

    async fn cancel_with_code(&self, code: CancelCode) -> Result<(), VerificationError> {
        if let Some(verifier) = self.verifier() {
            verifier.cancel_with_code(code).await
        } else {
            self.inner.flow.cancel(code).await
        }
    }

    /// Process a verification message the other side sent in this flow.
    #[instrument(skip(self, content), fields(flow_id = ?self.flow_id()))]
    pub async fn receive_event(
        &self,
        sender: &UserId,
        event_type: &str,
        content: &JsonValue,
    ) -> Result<(), VerificationError> {
        if sender != self.other_user_id() && sender != self.own_user_id() {
            warn!(%sender, "Ignoring a verification message from an unrelated user");
            return Ok(());
        }

        let content = match VerificationContent::parse(event_type, content) {
            Ok(content) => content,
            Err(e) => {
                warn!("Received an invalid verification message: {e}");
                self.cancel_with_code(CancelCode::InvalidMessage).await?;
                return Err(e);
            }
        };

        if self.phase().is_terminal() {
            debug!("Ignoring a verification message, the flow is over");
            return Ok(());
        }

        if self.timed_out() {
            return self.cancel_with_code(CancelCode::Timeout).await;
        }

        match content {
            VerificationContent::Request { .. } => {
                debug!("Ignoring a repeated verification request");
                Ok(())
            }
            VerificationContent::Ready { from_device, methods } => {
                if !self.we_started() || self.phase() != VerificationPhase::Requested {
                    return self.cancel_with_code(CancelCode::UnexpectedMessage).await;
                }

                self.inner.flow.set_other_device(from_device);
                self.inner.flow.set_phase(VerificationPhase::Ready {
                    their_methods: methods,
                    our_methods: SUPPORTED_METHODS.to_vec(),
                });
                Ok(())
            }
            VerificationContent::Start { from_device, method, content } => {
                let is_ready = matches!(self.phase(), VerificationPhase::Ready { .. });
                if !is_ready || self.verifier().is_some() {
                    return self.cancel_with_code(CancelCode::UnexpectedMessage).await;
                }

                if method != VerificationMethod::SasV1 {
                    return self.cancel_with_code(CancelCode::UnknownMethod).await;
                }

                self.inner.flow.set_other_device(from_device);
                let verifier = SasVerifier::from_start(
                    self.inner.flow.clone(),
                    self.inner.own_device.clone(),
                    self.create_sas_engine(),
                    content,
                );
                self.set_verifier(verifier);
                Ok(())
            }
            VerificationContent::Cancel { code, reason } => {
                self.inner.flow.receive_cancel(code, reason);
                if let (Some(verifier), VerificationPhase::Cancelled(info)) =
                    (self.verifier(), self.phase())
                {
                    verifier.on_flow_cancelled(info);
                }
                Ok(())
            }
            content @ (VerificationContent::Accept(_)
            | VerificationContent::Key(_)
            | VerificationContent::Mac(_)
            | VerificationContent::Done) => match self.verifier() {
                Some(verifier) => verifier.receive(content).await,
                None => self.cancel_with_code(CancelCode::UnexpectedMessage).await,
            },
        }
    }

    fn create_sas_engine(&self) -> Box<dyn super::SasEngine> {
        let flow_id = self.flow_id();
        let other_device = self.other_device_id();

        // The flow id is always set once the request exists.
        let flow_id = flow_id.unwrap_or_else(|| FlowId::ToDevice(TransactionId::new()));

        self.inner.engine.create_sas(&flow_id, self.other_user_id(), other_device.as_deref())
    }

    fn set_verifier(&self, verifier: SasVerifier) {
        *self.inner.verifier.lock().unwrap() = Some(verifier);
        self.inner.flow.set_phase(VerificationPhase::Started { method: VerificationMethod::SasV1 });
    }
}

/// How long a request with the given timestamp stays valid.
fn remaining_lifetime(timestamp: Option<u64>, now: u64) -> Result<Duration, VerificationError> {
    let Some(timestamp) = timestamp else {
        return Ok(VERIFICATION_TIMEOUT);
    };

    if timestamp > now {
        let skew = Duration::from_millis(timestamp - now);
        return if skew > MAX_CLOCK_SKEW {
            Err(VerificationError::StaleRequest)
        } else {
            Ok(VERIFICATION_TIMEOUT)
        };
    }

    let age = Duration::from_millis(now - timestamp);
    match VERIFICATION_TIMEOUT.checked_sub(age) {
        Some(remaining) if !remaining.is_zero() => Ok(remaining),
        _ => Err(VerificationError::StaleRequest),
    }
}

async fn cancel_on_timeout(inner: Weak<RequestInner>, lifetime: Duration) {
    sleep(lifetime).await;

    let Some(inner) = inner.upgrade() else {
        return;
    };

    let request = VerificationRequest { inner };
    if !request.phase().is_terminal() {
        info!(flow_id = ?request.flow_id(), "The verification request timed out");
        // Dropping our handle might abort this very task, detach the cancel.
        let _ = spawn(async move {
            if let Err(e) = request.cancel_with_code(CancelCode::Timeout).await {
                warn!("Couldn't cancel a timed out verification: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches2::assert_let;
    use futures_util::StreamExt;
    use matrix_client_test::{ALICE, BOB};
    use ruma::{
        events::key::verification::cancel::CancelCode, room_id, MilliSecondsSinceUnixEpoch,
        TransactionId, UInt,
    };
    use serde_json::json;

    use super::{remaining_lifetime, VerificationRequest};
    use crate::verification::{
        sas::tests::FakeEngine,
        tests::{transport, RecordingTransport},
        FlowId, SasState, VerificationError, VerificationPhase, VERIFICATION_TIMEOUT,
    };

    fn incoming(transport: Arc<RecordingTransport>) -> VerificationRequest {
        VerificationRequest::from_request_event(
            transport,
            Arc::new(FakeEngine::default()),
            ALICE.to_owned(),
            "ALICEDEVICE".into(),
            &BOB,
            FlowId::ToDevice(TransactionId::new()),
            "m.key.verification.request",
            &json!({
                "from_device": "BOBDEVICE",
                "methods": ["m.sas.v1"],
                "timestamp": MilliSecondsSinceUnixEpoch::now(),
            }),
            None,
        )
        .unwrap()
    }

    async fn outgoing(transport: Arc<RecordingTransport>) -> VerificationRequest {
        VerificationRequest::start_to_device(
            transport,
            Arc::new(FakeEngine::default()),
            ALICE.to_owned(),
            "ALICEDEVICE".into(),
            BOB.to_owned(),
            None,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_request_freshness() {
        let now = 1_000_000_000;
        assert_eq!(remaining_lifetime(None, now).unwrap(), VERIFICATION_TIMEOUT);
        assert_eq!(
            remaining_lifetime(Some(now - 60_000), now).unwrap(),
            VERIFICATION_TIMEOUT - Duration::from_secs(60)
        );
        assert_let!(
            Err(VerificationError::StaleRequest) = remaining_lifetime(Some(now - 600_000), now)
        );
        assert_let!(
            Err(VerificationError::StaleRequest) = remaining_lifetime(Some(now + 600_000), now)
        );
        assert!(remaining_lifetime(Some(now + 60_000), now).is_ok());
    }

    #[tokio::test]
    async fn test_stale_request_is_rejected() {
        let stale = MilliSecondsSinceUnixEpoch(
            MilliSecondsSinceUnixEpoch::now().get() - UInt::from(11 * 60 * 1000u32),
        );

        let result = VerificationRequest::from_request_event(
            transport(),
            Arc::new(FakeEngine::default()),
            ALICE.to_owned(),
            "ALICEDEVICE".into(),
            &BOB,
            FlowId::InRoom(room_id!("!dm:localhost").to_owned(), "$request".try_into().unwrap()),
            "m.room.message",
            &json!({
                "msgtype": "m.key.verification.request",
                "from_device": "BOBDEVICE",
                "methods": ["m.sas.v1"],
            }),
            Some(stale),
        );

        assert_let!(Err(VerificationError::StaleRequest) = result);
    }

    #[tokio::test]
    async fn test_accept_moves_to_ready() {
        let transport = transport();
        let request = incoming(transport.clone());

        assert_eq!(request.phase(), VerificationPhase::Requested);
        request.accept().await.unwrap();

        assert!(request.is_ready());
        let (event_type, content) = transport.sent_contents().pop().unwrap();
        assert_eq!(event_type, "m.key.verification.ready");
        assert_eq!(content["from_device"], "ALICEDEVICE");
        assert_eq!(content["transaction_id"], request.flow_id().unwrap().as_str());

        // Only possible once.
        assert_let!(Err(VerificationError::InvalidPhase { .. }) = request.accept().await);
    }

    #[tokio::test]
    async fn test_we_cant_accept_our_own_request() {
        let request = outgoing(transport()).await;
        assert_let!(Err(VerificationError::OwnRequest) = request.accept().await);
    }

    #[tokio::test]
    async fn test_outgoing_request_flow() {
        let transport = transport();
        let request = outgoing(transport.clone()).await;

        let (event_type, content) = transport.sent_contents().pop().unwrap();
        assert_eq!(event_type, "m.key.verification.request");
        assert_eq!(content["methods"], json!(["m.sas.v1"]));

        request
            .receive_event(
                &BOB,
                "m.key.verification.ready",
                &json!({ "from_device": "BOBDEVICE", "methods": ["m.sas.v1"] }),
            )
            .await
            .unwrap();
        assert!(request.is_ready());
        assert_eq!(request.other_device_id().unwrap(), "BOBDEVICE");

        let sas = request.start_sas().await.unwrap();
        assert_eq!(request.phase(), VerificationPhase::Started { method: "m.sas.v1".into() });
        assert_eq!(sas.state(), SasState::Started { we_started: true });
    }

    #[tokio::test]
    async fn test_verifier_created_on_their_start() {
        let transport = transport();
        let request = incoming(transport.clone());
        request.accept().await.unwrap();
        assert!(request.verifier().is_none());

        request
            .receive_event(
                &BOB,
                "m.key.verification.start",
                &json!({ "from_device": "BOBDEVICE", "method": "m.sas.v1" }),
            )
            .await
            .unwrap();

        let verifier = request.verifier().unwrap();
        assert!(!verifier.we_started());
        assert_eq!(request.phase(), VerificationPhase::Started { method: "m.sas.v1".into() });

        // The phase stays started while the verifier makes progress.
        verifier.accept().await.unwrap();
        request
            .receive_event(&BOB, "m.key.verification.key", &json!({ "key": "their_key" }))
            .await
            .unwrap();
        assert!(verifier.can_be_presented());
        assert_let!(VerificationPhase::Started { .. } = request.phase());
    }

    #[tokio::test]
    async fn test_start_before_ready_cancels() {
        let transport = transport();
        let request = incoming(transport.clone());

        request
            .receive_event(
                &BOB,
                "m.key.verification.start",
                &json!({ "from_device": "BOBDEVICE", "method": "m.sas.v1" }),
            )
            .await
            .unwrap();

        assert_let!(VerificationPhase::Cancelled(info) = request.phase());
        assert_eq!(info.cancel_code(), &CancelCode::UnexpectedMessage);
    }

    #[tokio::test]
    async fn test_concurrent_cancels_send_one_message() {
        let transport = transport();
        let request = incoming(transport.clone());

        let (first, second) = tokio::join!(request.cancel(), request.cancel());
        first.unwrap();
        second.unwrap();
        request.cancel().await.unwrap();

        assert_eq!(
            transport.sent_types().iter().filter(|t| *t == "m.key.verification.cancel").count(),
            1
        );
        assert_let!(VerificationPhase::Cancelled(info) = request.phase());
        assert!(info.cancelled_by_us());
        assert_eq!(info.cancel_code(), &CancelCode::User);
    }

    #[tokio::test]
    async fn test_remote_cancel_is_terminal() {
        let transport = transport();
        let request = incoming(transport.clone());
        request.accept().await.unwrap();

        request
            .receive_event(
                &BOB,
                "m.key.verification.cancel",
                &json!({ "code": "m.user", "reason": "nope" }),
            )
            .await
            .unwrap();

        assert_let!(VerificationPhase::Cancelled(info) = request.phase());
        assert!(!info.cancelled_by_us());
        assert_eq!(info.reason(), "nope");

        // Our own late cancel doesn't send anything.
        request.cancel().await.unwrap();
        assert!(!transport.sent_types().iter().any(|t| t == "m.key.verification.cancel"));
    }

    #[tokio::test]
    async fn test_cancel_after_done_is_an_error() {
        let transport = transport();
        let request = incoming(transport.clone());
        request.accept().await.unwrap();
        request
            .receive_event(
                &BOB,
                "m.key.verification.start",
                &json!({ "from_device": "BOBDEVICE", "method": "m.sas.v1" }),
            )
            .await
            .unwrap();

        let verifier = request.verifier().unwrap();
        verifier.accept().await.unwrap();
        request
            .receive_event(&BOB, "m.key.verification.key", &json!({ "key": "k" }))
            .await
            .unwrap();
        request.receive_event(&BOB, "m.key.verification.mac", &json!({ "mac": {} })).await.unwrap();
        verifier.confirm().await.unwrap();

        assert!(request.is_done());
        assert!(request.cancel().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let transport = transport();
        let request = incoming(transport.clone());
        let mut changes = request.changes();

        tokio::time::sleep(VERIFICATION_TIMEOUT + Duration::from_secs(1)).await;

        let phase = changes.next().await.unwrap();
        assert_let!(VerificationPhase::Cancelled(info) = phase);
        assert_eq!(info.cancel_code(), &CancelCode::Timeout);
        assert!(request.timed_out());
        assert_eq!(request.time_remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_incoming_request_keeps_only_its_remaining_lifetime() {
        let four_minutes_ago = MilliSecondsSinceUnixEpoch(
            MilliSecondsSinceUnixEpoch::now().get() - UInt::from(4 * 60 * 1000u32),
        );

        let request = VerificationRequest::from_request_event(
            transport(),
            Arc::new(FakeEngine::default()),
            ALICE.to_owned(),
            "ALICEDEVICE".into(),
            &BOB,
            FlowId::ToDevice(TransactionId::new()),
            "m.key.verification.request",
            &json!({
                "from_device": "BOBDEVICE",
                "methods": ["m.sas.v1"],
                "timestamp": four_minutes_ago,
            }),
            None,
        )
        .unwrap();
        let mut changes = request.changes();

        let remaining = request.time_remaining();
        assert!(remaining <= Duration::from_secs(6 * 60));
        assert!(remaining > Duration::from_secs(6 * 60 - 5));

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert!(!request.timed_out());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(request.timed_out());
        assert_eq!(request.time_remaining(), Duration::ZERO);

        let phase = changes.next().await.unwrap();
        assert_let!(VerificationPhase::Cancelled(info) = phase);
        assert_eq!(info.cancel_code(), &CancelCode::Timeout);
    }
}
