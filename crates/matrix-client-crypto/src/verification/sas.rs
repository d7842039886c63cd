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

use std::sync::{Arc, Mutex};

use eyeball::{ObservableWriteGuard, SharedObservable, Subscriber};
use matrix_client_common::AsyncTraitDeps;
use ruma::{
    events::key::verification::{cancel::CancelCode, VerificationMethod},
    DeviceId, OwnedDeviceId, OwnedUserId, UserId,
};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, trace};

use super::{
    CancelInfo, FlowId, VerificationContent, VerificationError, VerificationFlow, VerificationPhase,
};

/// An emoji that is used for interactive verification using a short auth
/// string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Emoji {
    /// The emoji symbol that represents a part of the short auth string.
    pub symbol: String,
    /// The description of the emoji, for example 'Dog'.
    pub description: String,
}

/// The cryptographic part of a SAS verification.
///
/// Implementations hold the ephemeral key pair, compute the commitment, the
/// short auth string and the MACs. Failures are reported as the cancel code
/// the flow gets cancelled with.
pub trait SasEngine: AsyncTraitDeps {
    /// The method specific fields of the `m.key.verification.start` message
    /// we send.
    fn start_content(&mut self) -> JsonValue;

    /// Accept the start message of the other side, returning the fields of
    /// our `m.key.verification.accept` message.
    fn accept_start(&mut self, start: &JsonValue) -> Result<JsonValue, CancelCode>;

    /// Process the accept message of the other side.
    fn receive_accept(&mut self, accept: &JsonValue) -> Result<(), CancelCode>;

    /// Our ephemeral public key.
    fn public_key(&self) -> String;

    /// Process the ephemeral public key of the other side, checking it
    /// against the commitment if we started.
    fn receive_key(&mut self, key: &str) -> Result<(), CancelCode>;

    /// The emoji representation of the short auth string, if both sides
    /// agreed on it.
    fn emoji(&self) -> Option<Vec<Emoji>>;

    /// The decimal representation of the short auth string.
    fn decimals(&self) -> (u16, u16, u16);

    /// The fields of our `m.key.verification.mac` message.
    fn mac_content(&self) -> JsonValue;

    /// Check the MAC message of the other side.
    fn verify_mac(&mut self, mac: &JsonValue) -> Result<(), CancelCode>;
}

/// Creates the method specific parts of verification flows.
pub trait VerificationEngine: AsyncTraitDeps {
    /// Create a SAS engine for a flow with the given device.
    fn create_sas(
        &self,
        flow_id: &FlowId,
        other_user: &UserId,
        other_device: Option<&DeviceId>,
    ) -> Box<dyn SasEngine>;
}

/// The state of a [`SasVerifier`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SasState {
    /// The start message was sent or received.
    Started {
        /// Did we send the start message.
        we_started: bool,
    },
    /// The verification was accepted, the keys are being exchanged.
    Accepted,
    /// The keys have been exchanged and the short auth string can be
    /// presented to the user.
    KeysExchanged {
        /// The emoji representation, if both sides support it.
        emoji: Option<Vec<Emoji>>,
        /// The decimal representation.
        decimals: (u16, u16, u16),
    },
    /// The user confirmed that the short auth string matches, waiting for
    /// the MAC of the other side.
    Confirmed,
    /// The MAC of the other side checked out, waiting for the user to
    /// confirm.
    MacReceived {
        /// The emoji representation, if both sides support it.
        emoji: Option<Vec<Emoji>>,
        /// The decimal representation.
        decimals: (u16, u16, u16),
    },
    /// The verification finished successfully.
    Done,
    /// The verification was cancelled.
    Cancelled(CancelInfo),
}

impl SasState {
    fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Accepted => "accepted",
            Self::KeysExchanged { .. } => "keys exchanged",
            Self::Confirmed => "confirmed",
            Self::MacReceived { .. } => "mac received",
            Self::Done => "done",
            Self::Cancelled(_) => "cancelled",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled(_))
    }
}

#[derive(Debug)]
struct SasInner {
    flow: Arc<VerificationFlow>,
    own_device: OwnedDeviceId,
    we_started: bool,
    engine: Mutex<Box<dyn SasEngine>>,
    state: SharedObservable<SasState>,
    /// The start message of the other side, needed to accept it.
    their_start: Option<JsonValue>,
}

/// Short authentication string verification.
///
/// Both sides exchange ephemeral keys and show the resulting short auth
/// string, as emoji or decimals, to their users, who compare them.
#[derive(Clone, Debug)]
pub struct SasVerifier {
    inner: Arc<SasInner>,
}

/// What to do after a state transition, done outside of the state lock.
enum Action {
    Send(&'static str, JsonValue),
    SendMacAndDone(JsonValue),
    Finish,
    Cancel(CancelCode),
    Nothing,
}

impl Action {
    fn send_key(engine: &dyn SasEngine) -> Self {
        Self::Send("m.key.verification.key", json!({ "key": engine.public_key() }))
    }
}

impl SasVerifier {
    /// Start a SAS flow as the initiating side and send the start message.
    pub(crate) async fn start(
        flow: Arc<VerificationFlow>,
        own_device: OwnedDeviceId,
        mut engine: Box<dyn SasEngine>,
    ) -> Result<Self, VerificationError> {
        let mut content = engine.start_content();
        content["from_device"] = own_device.as_str().into();
        content["method"] = VerificationMethod::SasV1.as_str().into();

        let verifier = Self::new(flow, own_device, engine, true, None);
        verifier.inner.flow.send("m.key.verification.start", content).await?;

        Ok(verifier)
    }

    /// Create the flow for a start message of the other side.
    pub(crate) fn from_start(
        flow: Arc<VerificationFlow>,
        own_device: OwnedDeviceId,
        engine: Box<dyn SasEngine>,
        start: JsonValue,
    ) -> Self {
        Self::new(flow, own_device, engine, false, Some(start))
    }

    fn new(
        flow: Arc<VerificationFlow>,
        own_device: OwnedDeviceId,
        engine: Box<dyn SasEngine>,
        we_started: bool,
        their_start: Option<JsonValue>,
    ) -> Self {
        Self {
            inner: Arc::new(SasInner {
                flow,
                own_device,
                we_started,
                engine: Mutex::new(engine),
                state: SharedObservable::new(SasState::Started { we_started }),
                their_start,
            }),
        }
    }

    /// The id of the flow.
    pub fn flow_id(&self) -> Option<FlowId> {
        self.inner.flow.flow_id()
    }

    /// The user we're verifying with.
    pub fn other_user_id(&self) -> &OwnedUserId {
        self.inner.flow.other_user()
    }

    /// Our own device id.
    pub fn own_device_id(&self) -> &DeviceId {
        &self.inner.own_device
    }

    /// Did we send the start message.
    pub fn we_started(&self) -> bool {
        self.inner.we_started
    }

    /// The current state.
    pub fn state(&self) -> SasState {
        self.inner.state.get()
    }

    /// Listen to state changes.
    pub fn changes(&self) -> Subscriber<SasState> {
        self.inner.state.subscribe()
    }

    /// Did the verification finish successfully.
    pub fn is_done(&self) -> bool {
        self.state() == SasState::Done
    }

    /// Was the verification cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), SasState::Cancelled(_))
    }

    /// Can the short auth string be presented to the user.
    pub fn can_be_presented(&self) -> bool {
        matches!(self.state(), SasState::KeysExchanged { .. } | SasState::MacReceived { .. })
    }

    /// The emoji the user should compare.
    pub fn emoji(&self) -> Option<Vec<Emoji>> {
        match self.state() {
            SasState::KeysExchanged { emoji, .. } | SasState::MacReceived { emoji, .. } => emoji,
            _ => None,
        }
    }

    /// The decimals the user should compare.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        match self.state() {
            SasState::KeysExchanged { decimals, .. } | SasState::MacReceived { decimals, .. } => {
                Some(decimals)
            }
            _ => None,
        }
    }

    fn short_auth_string(engine: &dyn SasEngine) -> (Option<Vec<Emoji>>, (u16, u16, u16)) {
        (engine.emoji(), engine.decimals())
    }

    /// Accept the start message of the other side.
    pub async fn accept(&self) -> Result<(), VerificationError> {
        let action = {
            let mut guard = self.inner.state.write();

            let state = (*guard).clone();

            match (state, &self.inner.their_start) {
                (SasState::Started { we_started: false }, Some(start)) => {
                    match self.inner.engine.lock().unwrap().accept_start(start) {
                        Ok(content) => {
                            ObservableWriteGuard::set(&mut guard, SasState::Accepted);
                            Action::Send("m.key.verification.accept", content)
                        }
                        Err(code) => Action::Cancel(code),
                    }
                }
                (state, _) => {
                    return Err(VerificationError::InvalidSasState {
                        expected: "started by the other side",
                        state: Box::new(state),
                    })
                }
            }
        };

        self.run(action).await
    }

    /// Confirm that the short auth strings match.
    pub async fn confirm(&self) -> Result<(), VerificationError> {
        let action = {
            let mut guard = self.inner.state.write();
            let mac = self.inner.engine.lock().unwrap().mac_content();
            let state = (*guard).clone();

            match state {
                SasState::KeysExchanged { .. } => {
                    ObservableWriteGuard::set(&mut guard, SasState::Confirmed);
                    Action::Send("m.key.verification.mac", mac)
                }
                SasState::MacReceived { .. } => {
                    ObservableWriteGuard::set(&mut guard, SasState::Done);
                    Action::SendMacAndDone(mac)
                }
                state => {
                    return Err(VerificationError::InvalidSasState {
                        expected: "keys exchanged",
                        state: Box::new(state),
                    })
                }
            }
        };

        self.run(action).await
    }

    /// Tell the other side that the short auth strings don't match.
    pub async fn mismatch(&self) -> Result<(), VerificationError> {
        self.cancel_with_code(CancelCode::MismatchedSas).await
    }

    /// Cancel the verification.
    pub async fn cancel(&self) -> Result<(), VerificationError> {
        self.cancel_with_code(CancelCode::User).await
    }

    pub(crate) async fn cancel_with_code(&self, code: CancelCode) -> Result<(), VerificationError> {
        {
            let mut guard = self.inner.state.write();
            if *guard == SasState::Done {
                return Err(VerificationError::InvalidSasState {
                    expected: "a non-terminal state",
                    state: Box::new(SasState::Done),
                });
            }
            if !guard.is_terminal() {
                let info = CancelInfo::new(true, code.clone());
                ObservableWriteGuard::set(&mut guard, SasState::Cancelled(info));
            }
        }

        self.inner.flow.cancel(code).await
    }

    /// Mirror a cancellation of the whole flow.
    pub(crate) fn on_flow_cancelled(&self, info: CancelInfo) {
        let mut guard = self.inner.state.write();
        if !guard.is_terminal() {
            ObservableWriteGuard::set(&mut guard, SasState::Cancelled(info));
        }
    }

    /// Process a message of the other side.
    pub(crate) async fn receive(
        &self,
        content: VerificationContent,
    ) -> Result<(), VerificationError> {
        let action = {
            let mut guard = self.inner.state.write();
            let mut engine = self.inner.engine.lock().unwrap();
            let old_state = guard.name();

            let state = (*guard).clone();

            let action = match (state, content) {
                (SasState::Started { we_started: true }, VerificationContent::Accept(accept)) => {
                    match engine.receive_accept(&accept) {
                        Ok(()) => {
                            ObservableWriteGuard::set(&mut guard, SasState::Accepted);
                            Action::send_key(engine.as_ref())
                        }
                        Err(code) => Action::Cancel(code),
                    }
                }
                (SasState::Accepted, VerificationContent::Key(key)) => {
                    let their_key = key.get("key").and_then(JsonValue::as_str);
                    match their_key.map(|k| engine.receive_key(k)) {
                        Some(Ok(())) => {
                            let (emoji, decimals) = Self::short_auth_string(engine.as_ref());
                            let state = SasState::KeysExchanged { emoji, decimals };
                            ObservableWriteGuard::set(&mut guard, state);

                            if self.inner.we_started {
                                Action::Nothing
                            } else {
                                Action::send_key(engine.as_ref())
                            }
                        }
                        Some(Err(code)) => Action::Cancel(code),
                        None => Action::Cancel(CancelCode::InvalidMessage),
                    }
                }
                (SasState::KeysExchanged { emoji, decimals }, VerificationContent::Mac(mac)) => {
                    match engine.verify_mac(&mac) {
                        Ok(()) => {
                            let state = SasState::MacReceived { emoji, decimals };
                            ObservableWriteGuard::set(&mut guard, state);
                            Action::Nothing
                        }
                        Err(code) => Action::Cancel(code),
                    }
                }
                (SasState::Confirmed, VerificationContent::Mac(mac)) => {
                    match engine.verify_mac(&mac) {
                        Ok(()) => {
                            ObservableWriteGuard::set(&mut guard, SasState::Done);
                            Action::Finish
                        }
                        Err(code) => Action::Cancel(code),
                    }
                }
                (
                    SasState::Confirmed | SasState::MacReceived { .. } | SasState::Done,
                    VerificationContent::Done,
                ) => Action::Nothing,
                (state, _) if state.is_terminal() => Action::Nothing,
                _ => Action::Cancel(CancelCode::UnexpectedMessage),
            };

            trace!(old_state, new_state = guard.name(), "SAS state transition");
            action
        };

        self.run(action).await
    }

    async fn run(&self, action: Action) -> Result<(), VerificationError> {
        match action {
            Action::Send(event_type, content) => {
                self.inner.flow.send(event_type, content).await?;
            }
            Action::SendMacAndDone(mac) => {
                self.inner.flow.send("m.key.verification.mac", mac).await?;
                self.finish().await?;
            }
            Action::Finish => self.finish().await?,
            Action::Cancel(code) => {
                debug!(?code, "Cancelling the SAS verification");
                self.cancel_with_code(code).await?;
            }
            Action::Nothing => {}
        }

        Ok(())
    }

    async fn finish(&self) -> Result<(), VerificationError> {
        self.inner.flow.send("m.key.verification.done", json!({})).await?;
        self.inner.flow.set_phase(VerificationPhase::Done);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use assert_matches2::assert_let;
    use matrix_client_test::BOB;
    use ruma::{
        events::key::verification::cancel::CancelCode, DeviceId, TransactionId, UserId,
    };
    use serde_json::{json, Value as JsonValue};

    use super::{Emoji, SasEngine, SasState, SasVerifier, VerificationEngine};
    use crate::verification::{
        tests::transport, FlowId, VerificationContent, VerificationError, VerificationFlow,
        VerificationPhase,
    };

    /// A SAS engine with a fixed short auth string, the MAC of the other
    /// side checks out unless its `mac` field is `"bad"`.
    #[derive(Debug, Default)]
    pub(crate) struct FakeSas {
        their_key: Option<String>,
    }

    impl SasEngine for FakeSas {
        fn start_content(&mut self) -> JsonValue {
            json!({ "key_agreement_protocols": ["curve25519-hkdf-sha256"] })
        }

        fn accept_start(&mut self, _start: &JsonValue) -> Result<JsonValue, CancelCode> {
            Ok(json!({ "commitment": "commitment" }))
        }

        fn receive_accept(&mut self, accept: &JsonValue) -> Result<(), CancelCode> {
            if accept.get("commitment").is_some() {
                Ok(())
            } else {
                Err(CancelCode::UnknownMethod)
            }
        }

        fn public_key(&self) -> String {
            "our_key".to_owned()
        }

        fn receive_key(&mut self, key: &str) -> Result<(), CancelCode> {
            self.their_key = Some(key.to_owned());
            Ok(())
        }

        fn emoji(&self) -> Option<Vec<Emoji>> {
            Some(vec![Emoji { symbol: "🐶".to_owned(), description: "Dog".to_owned() }; 7])
        }

        fn decimals(&self) -> (u16, u16, u16) {
            (1234, 5678, 9012)
        }

        fn mac_content(&self) -> JsonValue {
            json!({ "mac": { "ed25519:OURDEVICE": "mac" }, "keys": "keys_mac" })
        }

        fn verify_mac(&mut self, mac: &JsonValue) -> Result<(), CancelCode> {
            if mac["mac"] == "bad" {
                Err(CancelCode::KeyMismatch)
            } else {
                Ok(())
            }
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct FakeEngine {
        pub(crate) created: AtomicBool,
    }

    impl VerificationEngine for FakeEngine {
        fn create_sas(
            &self,
            _flow_id: &FlowId,
            _other_user: &UserId,
            _other_device: Option<&DeviceId>,
        ) -> Box<dyn SasEngine> {
            self.created.store(true, Ordering::SeqCst);
            Box::new(FakeSas::default())
        }
    }

    fn flow(
        transport: Arc<crate::verification::tests::RecordingTransport>,
    ) -> Arc<VerificationFlow> {
        Arc::new(VerificationFlow::new(
            Some(FlowId::ToDevice(TransactionId::new())),
            BOB.to_owned(),
            Some("BOBDEVICE".into()),
            transport,
        ))
    }

    #[tokio::test]
    async fn test_full_flow_as_the_starting_side() {
        let transport = transport();
        let flow = flow(transport.clone());
        let sas = SasVerifier::start(flow.clone(), "OURDEVICE".into(), Box::<FakeSas>::default())
            .await
            .unwrap();

        assert_eq!(sas.state(), SasState::Started { we_started: true });

        sas.receive(VerificationContent::Accept(json!({ "commitment": "c" }))).await.unwrap();
        assert_eq!(sas.state(), SasState::Accepted);

        sas.receive(VerificationContent::Key(json!({ "key": "their_key" }))).await.unwrap();
        assert!(sas.can_be_presented());
        assert_eq!(sas.decimals(), Some((1234, 5678, 9012)));
        assert_eq!(sas.emoji().unwrap().len(), 7);

        sas.confirm().await.unwrap();
        assert_eq!(sas.state(), SasState::Confirmed);

        sas.receive(VerificationContent::Mac(json!({ "mac": {}, "keys": "k" }))).await.unwrap();
        assert!(sas.is_done());
        assert_eq!(flow.phase(), VerificationPhase::Done);

        assert_eq!(
            transport.sent_types(),
            vec![
                "m.key.verification.start",
                "m.key.verification.key",
                "m.key.verification.mac",
                "m.key.verification.done",
            ]
        );
    }

    #[tokio::test]
    async fn test_full_flow_as_the_accepting_side() {
        let transport = transport();
        let flow = flow(transport.clone());
        let sas = SasVerifier::from_start(
            flow.clone(),
            "OURDEVICE".into(),
            Box::<FakeSas>::default(),
            json!({ "method": "m.sas.v1" }),
        );

        sas.accept().await.unwrap();
        sas.receive(VerificationContent::Key(json!({ "key": "their_key" }))).await.unwrap();

        // Their MAC arrives before our user confirmed.
        sas.receive(VerificationContent::Mac(json!({ "mac": {}, "keys": "k" }))).await.unwrap();
        assert_let!(SasState::MacReceived { .. } = sas.state());
        assert!(sas.can_be_presented());

        sas.confirm().await.unwrap();
        assert!(sas.is_done());

        assert_eq!(
            transport.sent_types(),
            vec![
                "m.key.verification.accept",
                "m.key.verification.key",
                "m.key.verification.mac",
                "m.key.verification.done",
            ]
        );

        let (_, key) = &transport.sent_contents()[1];
        assert_eq!(key["key"], "our_key");
        assert!(key["transaction_id"].is_string());
    }

    #[tokio::test]
    async fn test_mismatch_cancels_the_whole_flow() {
        let transport = transport();
        let flow = flow(transport.clone());
        let sas = SasVerifier::from_start(
            flow.clone(),
            "OURDEVICE".into(),
            Box::<FakeSas>::default(),
            json!({}),
        );
        sas.accept().await.unwrap();
        sas.receive(VerificationContent::Key(json!({ "key": "their_key" }))).await.unwrap();

        sas.mismatch().await.unwrap();

        assert_let!(SasState::Cancelled(info) = sas.state());
        assert_eq!(info.cancel_code(), &CancelCode::MismatchedSas);
        assert_let!(VerificationPhase::Cancelled(_) = flow.phase());

        let (event_type, content) = transport.sent_contents().pop().unwrap();
        assert_eq!(event_type, "m.key.verification.cancel");
        assert_eq!(content["code"], "m.mismatched_sas");
    }

    #[tokio::test]
    async fn test_unexpected_message_cancels() {
        let transport = transport();
        let flow = flow(transport.clone());
        let sas =
            SasVerifier::from_start(flow, "OURDEVICE".into(), Box::<FakeSas>::default(), json!({}));

        // A MAC before any key exchange.
        sas.receive(VerificationContent::Mac(json!({ "mac": {} }))).await.unwrap();

        assert_let!(SasState::Cancelled(info) = sas.state());
        assert_eq!(info.cancel_code(), &CancelCode::UnexpectedMessage);
        assert!(info.cancelled_by_us());
    }

    #[tokio::test]
    async fn test_bad_mac_cancels_with_key_mismatch() {
        let transport = transport();
        let sas = SasVerifier::from_start(
            flow(transport.clone()),
            "OURDEVICE".into(),
            Box::<FakeSas>::default(),
            json!({}),
        );
        sas.accept().await.unwrap();
        sas.receive(VerificationContent::Key(json!({ "key": "their_key" }))).await.unwrap();
        sas.receive(VerificationContent::Mac(json!({ "mac": "bad" }))).await.unwrap();

        assert_let!(SasState::Cancelled(info) = sas.state());
        assert_eq!(info.cancel_code(), &CancelCode::KeyMismatch);
    }

    #[tokio::test]
    async fn test_confirm_requires_exchanged_keys() {
        let sas = SasVerifier::from_start(
            flow(transport()),
            "OURDEVICE".into(),
            Box::<FakeSas>::default(),
            json!({}),
        );

        assert_let!(Err(VerificationError::InvalidSasState { .. }) = sas.confirm().await);
        // Accepting twice isn't possible either.
        sas.accept().await.unwrap();
        assert_let!(Err(VerificationError::InvalidSasState { .. }) = sas.accept().await);
    }
}
