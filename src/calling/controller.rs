//! Drives the media engine from the call state machine.
//!
//! Every input goes through [`step`]; the resulting actions run against the
//! engine and the session in order. Engine results are fed back as new
//! inputs until the machine settles. A failing engine operation drops the
//! rest of the batch and becomes a `MediaFailed` input.

use std::collections::VecDeque;

use tokio::time::Instant;

use super::engine::{
    CaptureSettings, EngineEvent, IceServer, MediaConstraints, MediaEngine, PeerConnectionState,
};
use super::ice::IceBuffer;
use super::machine::{step, CallAction, CallInput, CallState, Transition};
use crate::error::{NegotiationStage, SignalError};
use crate::event::{CallEndReason, ClientEvent};
use crate::janus::envelope::{PluginEvent, TrickleCandidate};
use crate::janus::session::{SessionEvent, SessionManager, SessionState};
use crate::janus::transaction::{refuse, Resolver, TransactionKind};

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub ice_servers: Vec<IceServer>,
    pub capture: CaptureSettings,
    pub constraints: MediaConstraints,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_servers(),
            capture: CaptureSettings::default(),
            constraints: MediaConstraints::default(),
        }
    }
}

pub struct NegotiationController<E: MediaEngine> {
    engine: E,
    config: NegotiationConfig,
    state: CallState,
    ice: IceBuffer,
    /// Caller awaiting `place_call` / `accept_incoming`.
    pending_verb: Option<Resolver>,
    notices: VecDeque<ClientEvent>,
    has_peer_connection: bool,
}

impl<E: MediaEngine> NegotiationController<E> {
    pub fn new(engine: E, config: NegotiationConfig) -> Self {
        Self {
            engine,
            config,
            state: CallState::Idle,
            ice: IceBuffer::new(),
            pending_verb: None,
            notices: VecDeque::new(),
            has_peer_connection: false,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Events produced since the last drain, oldest first.
    pub fn drain_notices(&mut self) -> Vec<ClientEvent> {
        self.notices.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Local verbs
    // -----------------------------------------------------------------------

    /// Start an outgoing call. `resolver` completes once the gateway
    /// acknowledges the `call` request.
    pub async fn place_call(
        &mut self,
        session: &mut SessionManager,
        peer: &str,
        now: Instant,
        resolver: Option<Resolver>,
    ) -> Result<(), SignalError> {
        if session.state() != SessionState::Registered {
            return refuse(
                resolver,
                SignalError::NotRegistered(format!("cannot call {} while {}", peer, session.state())),
            );
        }
        let t = match step(
            &self.state,
            CallInput::PlaceCall {
                peer: peer.to_string(),
            },
        ) {
            Ok(t) => t,
            Err(e) => return refuse(resolver, e),
        };
        tracing::info!("Calling {}", peer);
        self.set_pending_verb(resolver);
        self.run(session, t, now).await;
        Ok(())
    }

    /// Answer the ringing call.
    pub async fn accept_incoming(
        &mut self,
        session: &mut SessionManager,
        now: Instant,
        resolver: Option<Resolver>,
    ) -> Result<(), SignalError> {
        let t = match step(&self.state, CallInput::AcceptIncoming) {
            Ok(t) => t,
            Err(e) => return refuse(resolver, e),
        };
        self.set_pending_verb(resolver);
        self.run(session, t, now).await;
        Ok(())
    }

    pub async fn reject_incoming(
        &mut self,
        session: &mut SessionManager,
        now: Instant,
    ) -> Result<(), SignalError> {
        let t = step(&self.state, CallInput::RejectIncoming)?;
        self.run(session, t, now).await;
        Ok(())
    }

    /// Hang up whatever call is in progress. A no-op when idle.
    pub async fn hangup(&mut self, session: &mut SessionManager, now: Instant) {
        self.feed(session, CallInput::Hangup, now).await;
    }

    /// Release media unconditionally. Idempotent.
    pub async fn close(&mut self) {
        self.engine.close().await;
        self.ice.reset();
        self.has_peer_connection = false;
        if let Some(tx) = self.pending_verb.take() {
            let _ = tx.send(Err(SignalError::Cancelled));
        }
        self.state = CallState::Idle;
    }

    // -----------------------------------------------------------------------
    // Inputs from below
    // -----------------------------------------------------------------------

    pub async fn on_session_event(
        &mut self,
        session: &mut SessionManager,
        event: &SessionEvent,
        now: Instant,
    ) {
        let input = match event {
            SessionEvent::Plugin { event, jsep } => match event {
                PluginEvent::IncomingCall { username } => CallInput::IncomingCall {
                    peer: username.clone(),
                    offer: jsep.clone(),
                },
                PluginEvent::Accepted { .. } => CallInput::Accepted {
                    answer: jsep.clone(),
                },
                PluginEvent::Hangup { reason, .. } => CallInput::RemoteHangup {
                    reason: reason.clone(),
                },
                PluginEvent::Update if jsep.is_some() => {
                    tracing::warn!("Renegotiation is not supported, ignoring update");
                    return;
                }
                _ => return,
            },
            SessionEvent::MediaHangup { reason } => CallInput::RemoteHangup {
                reason: reason.clone(),
            },
            SessionEvent::WebrtcUp => CallInput::WebrtcUp,
            SessionEvent::RemoteCandidate(candidate) => {
                self.on_remote_candidate(candidate.clone()).await;
                return;
            }
            SessionEvent::RequestFailed {
                kind: TransactionKind::Call | TransactionKind::Accept,
                error,
            } => CallInput::RequestFailed(error.clone()),
            SessionEvent::Ended(error) => CallInput::SessionEnded(error.clone()),
            _ => return,
        };
        self.feed(session, input, now).await;
    }

    pub async fn on_engine_event(
        &mut self,
        session: &mut SessionManager,
        event: EngineEvent,
        now: Instant,
    ) {
        match event {
            EngineEvent::LocalCandidate(init) => {
                self.on_local_candidate(session, TrickleCandidate::Candidate(init), now)
            }
            EngineEvent::GatheringComplete => {
                self.on_local_candidate(session, TrickleCandidate::Completed, now)
            }
            EngineEvent::LocalStream => self.notices.push_back(ClientEvent::LocalStream),
            EngineEvent::RemoteTrack(kind) => {
                self.notices.push_back(ClientEvent::RemoteStream { kind })
            }
            EngineEvent::ConnectionState(state) => {
                tracing::debug!("ICE connection {}", state);
                self.notices.push_back(ClientEvent::ConnectionState(state));
                if state == PeerConnectionState::Failed {
                    let err = SignalError::MediaNegotiationFailed {
                        stage: NegotiationStage::PeerConnection,
                        detail: "ICE connection failed".into(),
                    };
                    self.feed(session, CallInput::MediaFailed(err), now).await;
                }
            }
        }
    }

    fn on_local_candidate(
        &mut self,
        session: &mut SessionManager,
        candidate: TrickleCandidate,
        now: Instant,
    ) {
        if matches!(self.state, CallState::Idle | CallState::Closing) {
            tracing::debug!("Dropping local candidate, no call in progress");
            return;
        }
        for c in self.ice.push_local(candidate) {
            if let Err(e) = session.trickle(c, now) {
                tracing::warn!("Could not trickle local candidate: {}", e);
            }
        }
    }

    async fn on_remote_candidate(&mut self, candidate: TrickleCandidate) {
        if matches!(self.state, CallState::Idle | CallState::Closing) {
            tracing::debug!("Dropping remote candidate, no call in progress");
            return;
        }
        match self.ice.push_remote(candidate) {
            Some(c) => {
                if let Err(e) = self.engine.add_ice_candidate(&c).await {
                    tracing::warn!("Remote candidate rejected: {:#}", e);
                }
            }
            None => tracing::debug!(
                "Holding remote candidate until the remote description is set ({} held)",
                self.ice.buffered_remote()
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Machinery
    // -----------------------------------------------------------------------

    fn set_pending_verb(&mut self, resolver: Option<Resolver>) {
        if let Some(previous) = std::mem::replace(&mut self.pending_verb, resolver) {
            let _ = previous.send(Err(SignalError::Cancelled));
        }
    }

    async fn feed(&mut self, session: &mut SessionManager, input: CallInput, now: Instant) {
        match step(&self.state, input) {
            Ok(t) => self.run(session, t, now).await,
            Err(e) => tracing::warn!("{}", e),
        }
    }

    /// Apply `first`, then keep stepping on the inputs its actions produce.
    async fn run(&mut self, session: &mut SessionManager, first: Transition, now: Instant) {
        let mut pending = VecDeque::from([first]);
        while let Some(t) = pending.pop_front() {
            if t.next != self.state {
                tracing::debug!("Call: {} -> {}", self.state, t.next);
            }
            self.state = t.next;

            let mut follow_ups = Vec::new();
            for action in t.actions {
                if let Some(input) = self.perform(session, action, now).await {
                    let failed = matches!(input, CallInput::MediaFailed(_));
                    follow_ups.push(input);
                    if failed {
                        break;
                    }
                }
            }
            for input in follow_ups {
                match step(&self.state, input) {
                    Ok(t) => pending.push_back(t),
                    Err(e) => tracing::warn!("{}", e),
                }
            }
        }
    }

    async fn perform(
        &mut self,
        session: &mut SessionManager,
        action: CallAction,
        now: Instant,
    ) -> Option<CallInput> {
        match action {
            CallAction::PreparePeerConnection => {
                if !self.has_peer_connection {
                    if let Err(e) = self
                        .engine
                        .create_peer_connection(&self.config.ice_servers)
                        .await
                    {
                        return Some(media_failed(NegotiationStage::PeerConnection, &e));
                    }
                    self.has_peer_connection = true;
                    if let Err(e) = self.engine.start_local_capture(&self.config.capture).await {
                        return Some(media_failed(NegotiationStage::LocalCapture, &e));
                    }
                }
                Some(CallInput::PeerConnectionReady)
            }
            CallAction::CreateOffer => match self.engine.create_offer(&self.config.constraints).await {
                Ok(jsep) => Some(CallInput::OfferCreated(jsep)),
                Err(e) => Some(media_failed(NegotiationStage::CreateOffer, &e)),
            },
            CallAction::CreateAnswer => {
                match self.engine.create_answer(&self.config.constraints).await {
                    Ok(jsep) => Some(CallInput::AnswerCreated(jsep)),
                    Err(e) => Some(media_failed(NegotiationStage::CreateAnswer, &e)),
                }
            }
            CallAction::SetLocalDescription(jsep) => {
                match self.engine.set_local_description(&jsep).await {
                    Ok(()) => Some(CallInput::LocalDescriptionSet),
                    Err(e) => Some(media_failed(NegotiationStage::SetLocalDescription, &e)),
                }
            }
            CallAction::SetRemoteDescription(jsep) => {
                if let Err(e) = self.engine.set_remote_description(&jsep).await {
                    return Some(media_failed(NegotiationStage::SetRemoteDescription, &e));
                }
                for c in self.ice.remote_description_set() {
                    if let Err(e) = self.engine.add_ice_candidate(&c).await {
                        tracing::warn!("Buffered remote candidate rejected: {:#}", e);
                    }
                }
                Some(CallInput::RemoteDescriptionSet)
            }
            CallAction::SendCall { peer, offer } => {
                let resolver = self.pending_verb.take();
                if let Err(e) = session.call(&peer, offer, now, resolver) {
                    return Some(CallInput::RequestFailed(e));
                }
                self.flush_local_candidates(session, now);
                None
            }
            CallAction::SendAccept(answer) => {
                let resolver = self.pending_verb.take();
                if let Err(e) = session.accept(answer, now, resolver) {
                    return Some(CallInput::RequestFailed(e));
                }
                self.flush_local_candidates(session, now);
                None
            }
            CallAction::SendHangup => {
                session.hangup(now);
                None
            }
            CallAction::RejectCaller { peer } => {
                session.decline(&peer, now);
                None
            }
            CallAction::ReleaseMedia => {
                self.engine.close().await;
                self.ice.reset();
                self.has_peer_connection = false;
                Some(CallInput::MediaReleased)
            }
            CallAction::Notify(event) => {
                if let ClientEvent::CallEnded { reason, .. } = &event {
                    if let Some(tx) = self.pending_verb.take() {
                        let err = match reason {
                            CallEndReason::Failed(e) => e.clone(),
                            _ => SignalError::Cancelled,
                        };
                        let _ = tx.send(Err(err));
                    }
                }
                self.notices.push_back(event);
                None
            }
        }
    }

    /// The offer or answer is on its way: local candidates may follow it.
    fn flush_local_candidates(&mut self, session: &mut SessionManager, now: Instant) {
        for c in self.ice.local_description_set() {
            if let Err(e) = session.trickle(c, now) {
                tracing::warn!("Could not trickle local candidate: {}", e);
            }
        }
    }
}

fn media_failed(stage: NegotiationStage, e: &anyhow::Error) -> CallInput {
    tracing::warn!("Media negotiation failed at {}: {:#}", stage, e);
    CallInput::MediaFailed(SignalError::media(stage, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::engine::testing::{Journal, RecordingEngine};
    use crate::janus::envelope::{IceCandidateInit, Jsep};
    use crate::janus::session::testing::{drain, registered};
    use serde_json::json;
    use tokio::sync::oneshot;

    fn controller() -> (NegotiationController<RecordingEngine>, Journal) {
        let (engine, journal) = RecordingEngine::new();
        (
            NegotiationController::new(engine, NegotiationConfig::default()),
            journal,
        )
    }

    fn incoming(peer: &str, jsep: Option<Jsep>) -> SessionEvent {
        SessionEvent::Plugin {
            event: PluginEvent::IncomingCall {
                username: peer.into(),
            },
            jsep,
        }
    }

    fn accepted(jsep: Option<Jsep>) -> SessionEvent {
        SessionEvent::Plugin {
            event: PluginEvent::Accepted { username: None },
            jsep,
        }
    }

    fn host(addr: &str) -> TrickleCandidate {
        TrickleCandidate::Candidate(IceCandidateInit {
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
            candidate: format!("candidate:1 1 udp 2130706431 {} 5000 typ host", addr),
        })
    }

    #[tokio::test]
    async fn test_place_call_sends_offer_after_local_description() {
        let now = Instant::now();
        let mut session = registered(now);
        let (mut ctl, journal) = controller();

        ctl.place_call(&mut session, "bob", now, None).await.unwrap();
        assert_eq!(
            journal.entries(),
            vec![
                "create_peer_connection",
                "start_local_capture",
                "create_offer",
                "set_local_description:offer",
            ]
        );
        let frames = drain(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["body"], json!({"request":"call","username":"bob"}));
        assert_eq!(frames[0]["jsep"], json!({"type":"offer","sdp":"O"}));
        assert_eq!(ctl.state(), &CallState::OfferSent { peer: "bob".into() });

        ctl.on_session_event(&mut session, &accepted(Some(Jsep::answer("A"))), now)
            .await;
        assert_eq!(
            journal.entries().last().map(String::as_str),
            Some("set_remote_description:answer:A")
        );
        assert_eq!(
            ctl.drain_notices(),
            vec![ClientEvent::CallAccepted { peer: "bob".into() }]
        );
    }

    #[tokio::test]
    async fn test_place_call_requires_registration() {
        let now = Instant::now();
        let mut session = crate::janus::session::testing::ready(now);
        let (mut ctl, journal) = controller();
        let (tx, mut rx) = oneshot::channel();
        let err = ctl
            .place_call(&mut session, "bob", now, Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::NotRegistered(_)));
        assert!(matches!(rx.try_recv().unwrap(), Err(SignalError::NotRegistered(_))));
        assert!(journal.entries().is_empty());
        assert!(drain(&mut session).is_empty());
    }

    #[tokio::test]
    async fn test_local_candidates_follow_the_call_request() {
        let now = Instant::now();
        let mut session = registered(now);
        let (mut ctl, _journal) = controller();

        // A candidate before any call is dropped.
        ctl.on_engine_event(&mut session, EngineEvent::GatheringComplete, now)
            .await;
        assert!(drain(&mut session).is_empty());

        ctl.place_call(&mut session, "bob", now, None).await.unwrap();
        drain(&mut session);
        ctl.on_engine_event(
            &mut session,
            EngineEvent::LocalCandidate(IceCandidateInit {
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            }),
            now,
        )
        .await;
        ctl.on_engine_event(&mut session, EngineEvent::GatheringComplete, now)
            .await;
        ctl.on_engine_event(&mut session, EngineEvent::GatheringComplete, now)
            .await;
        let frames = drain(&mut session);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["janus"], "trickle");
        assert_eq!(frames[0]["candidate"]["sdpMid"], "0");
        assert_eq!(frames[1]["candidate"], json!({"completed": true}));
    }

    #[tokio::test]
    async fn test_incoming_call_answered() {
        let now = Instant::now();
        let mut session = registered(now);
        let (mut ctl, journal) = controller();

        ctl.on_session_event(&mut session, &incoming("carol", Some(Jsep::offer("X"))), now)
            .await;
        assert_eq!(
            ctl.drain_notices(),
            vec![ClientEvent::IncomingCall {
                peer: "carol".into()
            }]
        );
        // Remote candidates wait for the remote description.
        ctl.on_session_event(&mut session, &SessionEvent::RemoteCandidate(host("10.0.0.9")), now)
            .await;
        assert_eq!(
            journal.entries(),
            vec!["create_peer_connection", "start_local_capture"]
        );

        ctl.accept_incoming(&mut session, now, None).await.unwrap();
        assert_eq!(
            journal.entries()[2..],
            [
                "set_remote_description:offer:X".to_string(),
                "add_ice_candidate:candidate:1 1 udp 2130706431 10.0.0.9 5000 typ host".to_string(),
                "create_answer".to_string(),
                "set_local_description:answer".to_string(),
            ]
        );
        let accept = drain(&mut session).remove(0);
        assert_eq!(accept["body"], json!({"request":"accept"}));
        assert_eq!(accept["jsep"]["type"], "answer");
        assert_eq!(ctl.state(), &CallState::AnswerSent { peer: "carol".into() });

        ctl.on_session_event(&mut session, &SessionEvent::WebrtcUp, now)
            .await;
        assert_eq!(
            ctl.drain_notices(),
            vec![ClientEvent::CallEstablished {
                peer: "carol".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_reject_incoming_hangs_up_and_releases() {
        let now = Instant::now();
        let mut session = registered(now);
        let (mut ctl, journal) = controller();
        ctl.on_session_event(&mut session, &incoming("carol", Some(Jsep::offer("X"))), now)
            .await;
        ctl.drain_notices();

        ctl.reject_incoming(&mut session, now).await.unwrap();
        let h = drain(&mut session).remove(0);
        assert_eq!(h["body"], json!({"request":"hangup"}));
        assert_eq!(journal.entries().last().map(String::as_str), Some("close"));
        assert_eq!(ctl.state(), &CallState::Idle);
        assert_eq!(
            ctl.drain_notices(),
            vec![ClientEvent::CallEnded {
                peer: Some("carol".into()),
                reason: CallEndReason::Rejected
            }]
        );
        assert!(ctl.reject_incoming(&mut session, now).await.is_err());
    }

    #[tokio::test]
    async fn test_engine_failure_releases_media() {
        let now = Instant::now();
        let mut session = registered(now);
        let (mut engine, journal) = RecordingEngine::new();
        engine.fail_on = Some("create_offer");
        let mut ctl = NegotiationController::new(engine, NegotiationConfig::default());
        let (tx, mut rx) = oneshot::channel();

        ctl.place_call(&mut session, "bob", now, Some(tx)).await.unwrap();
        assert!(drain(&mut session).is_empty());
        assert_eq!(journal.entries().last().map(String::as_str), Some("close"));
        assert_eq!(ctl.state(), &CallState::Idle);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(SignalError::MediaNegotiationFailed {
                stage: NegotiationStage::CreateOffer,
                ..
            })
        ));
        assert!(matches!(
            ctl.drain_notices().as_slice(),
            [ClientEvent::CallEnded {
                reason: CallEndReason::Failed(SignalError::MediaNegotiationFailed { .. }),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_remote_hangup_mid_call() {
        let now = Instant::now();
        let mut session = registered(now);
        let (mut ctl, journal) = controller();
        ctl.place_call(&mut session, "bob", now, None).await.unwrap();
        ctl.on_session_event(&mut session, &accepted(Some(Jsep::answer("A"))), now)
            .await;
        drain(&mut session);
        ctl.drain_notices();

        let hangup = SessionEvent::Plugin {
            event: PluginEvent::Hangup {
                username: Some("bob".into()),
                reason: Some("Remote hangup".into()),
            },
            jsep: None,
        };
        ctl.on_session_event(&mut session, &hangup, now).await;
        // The gateway's media hangup right after is stale.
        ctl.on_session_event(&mut session, &SessionEvent::MediaHangup { reason: None }, now)
            .await;
        assert!(drain(&mut session).is_empty());
        assert_eq!(journal.entries().iter().filter(|e| *e == "close").count(), 1);
        assert_eq!(
            ctl.drain_notices(),
            vec![ClientEvent::CallEnded {
                peer: Some("bob".into()),
                reason: CallEndReason::RemoteHangup(Some("Remote hangup".into()))
            }]
        );
        assert_eq!(ctl.state(), &CallState::Idle);
    }

    #[tokio::test]
    async fn test_incoming_while_busy_is_declined() {
        let now = Instant::now();
        let mut session = registered(now);
        let (mut ctl, journal) = controller();
        ctl.place_call(&mut session, "bob", now, None).await.unwrap();
        drain(&mut session);
        let before = journal.entries().len();

        ctl.on_session_event(&mut session, &incoming("eve", Some(Jsep::offer("X"))), now)
            .await;
        let h = drain(&mut session).remove(0);
        assert_eq!(h["body"], json!({"request":"hangup"}));
        assert_eq!(journal.entries().len(), before);
        assert_eq!(ctl.state(), &CallState::OfferSent { peer: "bob".into() });
        assert_eq!(session.active_peer(), Some("bob"));
    }

    #[tokio::test]
    async fn test_session_loss_fails_call() {
        let now = Instant::now();
        let mut session = registered(now);
        let (mut ctl, _journal) = controller();
        ctl.place_call(&mut session, "bob", now, None).await.unwrap();
        ctl.drain_notices();

        let err = SignalError::TransportClosedUnexpectedly {
            code: 1006,
            reason: "reset".into(),
        };
        ctl.on_session_event(&mut session, &SessionEvent::Ended(Some(err.clone())), now)
            .await;
        assert_eq!(
            ctl.drain_notices(),
            vec![ClientEvent::CallEnded {
                peer: Some("bob".into()),
                reason: CallEndReason::Failed(err)
            }]
        );
    }
}
