//! Call state machine.
//!
//! `step` is a pure function of the current state and one input. It returns
//! the next state plus the actions the controller must perform, in order.
//! Engine results come back as inputs (`OfferCreated`, `LocalDescriptionSet`,
//! ...), so nested SDP callbacks become a flat sequence of transitions.
//!
//! ```text
//! IDLE --place_call--> OFFERING --offer+local set--> OFFER_SENT --accepted--> ESTABLISHED
//! IDLE --incomingcall--> INCOMING --accept--> ANSWERING --answer+local set--> ANSWER_SENT
//! ANSWER_SENT --accepted|webrtcup--> ESTABLISHED
//! any --hangup|failure--> CLOSING --media released--> IDLE
//! ```

use std::fmt;

use crate::error::SignalError;
use crate::event::{CallEndReason, ClientEvent};
use crate::janus::envelope::{Jsep, SdpType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Building the local offer. `offer` is set once the engine produced it.
    Offering { peer: String, offer: Option<Jsep> },
    OfferSent { peer: String },
    Incoming { peer: String, offer: Jsep },
    /// Building the local answer. `answer` is set once the engine produced it.
    Answering { peer: String, answer: Option<Jsep> },
    AnswerSent { peer: String },
    Established { peer: String, media_up: bool },
    Closing,
}

impl CallState {
    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::Offering { peer, .. }
            | Self::OfferSent { peer }
            | Self::Incoming { peer, .. }
            | Self::Answering { peer, .. }
            | Self::AnswerSent { peer }
            | Self::Established { peer, .. } => Some(peer),
            Self::Idle | Self::Closing => None,
        }
    }

    /// Whether the gateway already knows about this call, so tearing it
    /// down locally needs a `hangup` request.
    fn known_to_gateway(&self) -> bool {
        matches!(
            self,
            Self::OfferSent { .. }
                | Self::Incoming { .. }
                | Self::Answering { .. }
                | Self::AnswerSent { .. }
                | Self::Established { .. }
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Offering { peer, .. } => write!(f, "offering to {}", peer),
            Self::OfferSent { peer } => write!(f, "calling {}", peer),
            Self::Incoming { peer, .. } => write!(f, "ringing from {}", peer),
            Self::Answering { peer, .. } => write!(f, "answering {}", peer),
            Self::AnswerSent { peer } => write!(f, "answered {}", peer),
            Self::Established { peer, .. } => write!(f, "in a call with {}", peer),
            Self::Closing => f.write_str("closing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    // Local verbs
    PlaceCall { peer: String },
    AcceptIncoming,
    RejectIncoming,
    Hangup,
    // Plugin / gateway
    IncomingCall { peer: String, offer: Option<Jsep> },
    Accepted { answer: Option<Jsep> },
    RemoteHangup { reason: Option<String> },
    WebrtcUp,
    /// The `call` or `accept` request failed at the gateway.
    RequestFailed(SignalError),
    /// The session ended under the call. `None` for an orderly shutdown.
    SessionEnded(Option<SignalError>),
    // Media engine
    PeerConnectionReady,
    OfferCreated(Jsep),
    AnswerCreated(Jsep),
    LocalDescriptionSet,
    RemoteDescriptionSet,
    MediaFailed(SignalError),
    MediaReleased,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    /// Create the peer connection if absent and start local capture.
    PreparePeerConnection,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(Jsep),
    SetRemoteDescription(Jsep),
    SendCall { peer: String, offer: Jsep },
    SendAccept(Jsep),
    SendHangup,
    /// Turn away a caller while busy, leaving our own call untouched.
    RejectCaller { peer: String },
    ReleaseMedia,
    Notify(ClientEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: CallState,
    pub actions: Vec<CallAction>,
}

impl Transition {
    fn to(next: CallState, actions: Vec<CallAction>) -> Self {
        Self { next, actions }
    }

    fn stay(state: &CallState) -> Self {
        Self {
            next: state.clone(),
            actions: Vec::new(),
        }
    }
}

/// Tear the call down: tell the gateway if it knows, release media, report.
fn end_call(state: &CallState, reason: CallEndReason) -> Transition {
    let mut actions = Vec::new();
    if state.known_to_gateway() {
        actions.push(CallAction::SendHangup);
    }
    actions.push(CallAction::ReleaseMedia);
    actions.push(CallAction::Notify(ClientEvent::CallEnded {
        peer: state.peer().map(str::to_string),
        reason,
    }));
    Transition::to(CallState::Closing, actions)
}

/// Same as [`end_call`], minus the `hangup` request.
fn drop_call(state: &CallState, reason: CallEndReason) -> Transition {
    let mut t = end_call(state, reason);
    t.actions.retain(|a| *a != CallAction::SendHangup);
    t
}

/// Advance the call. `Err` only for local verbs issued in the wrong state;
/// inputs that no longer apply (stale engine results, events for a call
/// already gone) leave the state unchanged.
pub fn step(state: &CallState, input: CallInput) -> Result<Transition, SignalError> {
    use CallAction as A;
    use CallInput as I;
    use CallState as S;

    let t = match (state, input) {
        // ---- outbound call ------------------------------------------------
        (S::Idle, I::PlaceCall { peer }) => Transition::to(
            S::Offering { peer, offer: None },
            vec![A::PreparePeerConnection],
        ),
        (S::Offering { offer: None, .. }, I::PeerConnectionReady) => {
            Transition::to(state.clone(), vec![A::CreateOffer])
        }
        (S::Offering { peer, offer: None }, I::OfferCreated(jsep)) => Transition::to(
            S::Offering {
                peer: peer.clone(),
                offer: Some(jsep.clone()),
            },
            vec![A::SetLocalDescription(jsep)],
        ),
        (
            S::Offering {
                peer,
                offer: Some(offer),
            },
            I::LocalDescriptionSet,
        ) => Transition::to(
            S::OfferSent { peer: peer.clone() },
            vec![A::SendCall {
                peer: peer.clone(),
                offer: offer.clone(),
            }],
        ),
        (S::OfferSent { peer }, I::Accepted { answer }) => match answer {
            Some(jsep) if jsep.kind == SdpType::Answer => Transition::to(
                S::Established {
                    peer: peer.clone(),
                    media_up: false,
                },
                vec![
                    A::SetRemoteDescription(jsep),
                    A::Notify(ClientEvent::CallAccepted { peer: peer.clone() }),
                ],
            ),
            other => end_call(
                state,
                CallEndReason::Failed(SignalError::ProtocolParse(format!(
                    "accepted without an answer (got {:?})",
                    other.map(|j| j.kind)
                ))),
            ),
        },

        // ---- inbound call -------------------------------------------------
        (S::Idle, I::IncomingCall { peer, offer }) => match offer {
            Some(jsep) if jsep.kind == SdpType::Offer => Transition::to(
                S::Incoming {
                    peer: peer.clone(),
                    offer: jsep,
                },
                vec![
                    A::PreparePeerConnection,
                    A::Notify(ClientEvent::IncomingCall { peer }),
                ],
            ),
            _ => {
                let err = SignalError::ProtocolParse(format!(
                    "incoming call from {} without an offer",
                    peer
                ));
                Transition::to(
                    S::Idle,
                    vec![
                        A::RejectCaller { peer },
                        A::Notify(ClientEvent::error(&err)),
                    ],
                )
            }
        },
        (_, I::IncomingCall { peer, .. }) => {
            tracing::info!("Busy ({}), turning away {}", state, peer);
            Transition::to(state.clone(), vec![A::RejectCaller { peer }])
        }
        (S::Incoming { .. }, I::PeerConnectionReady) => Transition::stay(state),
        (S::Incoming { peer, offer }, I::AcceptIncoming) => Transition::to(
            S::Answering {
                peer: peer.clone(),
                answer: None,
            },
            vec![A::SetRemoteDescription(offer.clone())],
        ),
        (S::Incoming { .. }, I::RejectIncoming) => end_call(state, CallEndReason::Rejected),
        (S::Answering { answer: None, .. }, I::RemoteDescriptionSet) => {
            Transition::to(state.clone(), vec![A::CreateAnswer])
        }
        (S::Answering { peer, answer: None }, I::AnswerCreated(jsep)) => Transition::to(
            S::Answering {
                peer: peer.clone(),
                answer: Some(jsep.clone()),
            },
            vec![A::SetLocalDescription(jsep)],
        ),
        (
            S::Answering {
                peer,
                answer: Some(answer),
            },
            I::LocalDescriptionSet,
        ) => Transition::to(
            S::AnswerSent { peer: peer.clone() },
            vec![A::SendAccept(answer.clone())],
        ),
        (S::AnswerSent { peer }, I::Accepted { .. }) => Transition::to(
            S::Established {
                peer: peer.clone(),
                media_up: false,
            },
            vec![A::Notify(ClientEvent::CallAccepted { peer: peer.clone() })],
        ),

        // ---- media up -----------------------------------------------------
        (S::AnswerSent { peer }, I::WebrtcUp)
        | (
            S::Established {
                peer,
                media_up: false,
            },
            I::WebrtcUp,
        ) => Transition::to(
            S::Established {
                peer: peer.clone(),
                media_up: true,
            },
            vec![A::Notify(ClientEvent::CallEstablished { peer: peer.clone() })],
        ),

        // ---- teardown -----------------------------------------------------
        (S::Idle, I::Hangup) | (S::Closing, I::Hangup) => Transition::stay(state),
        (_, I::Hangup) => end_call(state, CallEndReason::LocalHangup),
        (S::Idle, I::RemoteHangup { .. }) | (S::Closing, I::RemoteHangup { .. }) => {
            Transition::stay(state)
        }
        (_, I::RemoteHangup { reason }) => drop_call(state, CallEndReason::RemoteHangup(reason)),
        (S::Idle, I::MediaFailed(_)) | (S::Closing, I::MediaFailed(_)) => Transition::stay(state),
        (_, I::MediaFailed(err)) => end_call(state, CallEndReason::Failed(err)),
        (S::Offering { .. }, I::RequestFailed(err))
        | (S::OfferSent { .. }, I::RequestFailed(err)) => {
            drop_call(state, CallEndReason::Failed(err))
        }
        // The incoming call outlives a failed accept on the gateway side.
        (S::Answering { .. }, I::RequestFailed(err))
        | (S::AnswerSent { .. }, I::RequestFailed(err)) => {
            end_call(state, CallEndReason::Failed(err))
        }
        (S::Idle, I::SessionEnded(_)) | (S::Closing, I::SessionEnded(_)) => {
            Transition::stay(state)
        }
        (_, I::SessionEnded(err)) => {
            let reason = match err {
                Some(e) => CallEndReason::Failed(e),
                None => CallEndReason::LocalHangup,
            };
            drop_call(state, reason)
        }
        (S::Closing, I::MediaReleased) => Transition::to(S::Idle, Vec::new()),

        // ---- local verbs in the wrong state -------------------------------
        (_, I::PlaceCall { .. }) => {
            return Err(SignalError::invalid_state(state, "place a call"));
        }
        (_, I::AcceptIncoming) => {
            return Err(SignalError::invalid_state(state, "accept a call"));
        }
        (_, I::RejectIncoming) => {
            return Err(SignalError::invalid_state(state, "reject a call"));
        }

        // ---- anything else is stale ---------------------------------------
        (_, input) => {
            tracing::debug!("Ignoring {:?} while {}", input, state);
            Transition::stay(state)
        }
    };
    Ok(t)
}
