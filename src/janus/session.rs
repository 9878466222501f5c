//! Janus session + videocall handle lifecycle.
//!
//! `SessionManager` is sans-IO: the client loop feeds it transport events,
//! inbound text frames and the current time, and drains outbound frames and
//! [`SessionEvent`]s from it. It never touches a socket or a timer itself.
//!
//! ```text
//! IDLE --opened--> CREATING_SESSION --success--> ATTACHING --success--> READY
//! READY --registered--> REGISTERED
//! CREATING_SESSION / ATTACHING --error|timeout--> FAILED
//! any --transport closed--> CLOSED
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::envelope::{
    CallSettings, HandleId, Inbound, JanusKind, Jsep, PluginEvent, PluginRequest, Request,
    SdpType, SessionId, TrickleCandidate, VIDEOCALL_PLUGIN,
};
use super::transaction::{refuse, AckOutcome, Resolver, TransactionKind, TransactionTable};
use crate::error::SignalError;
use crate::transport::CLOSE_NORMAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    CreatingSession,
    Attaching,
    Ready,
    Registered,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// READY or REGISTERED: both ids known, plugin reachable.
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Ready | Self::Registered)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::CreatingSession => "creating session",
            Self::Attaching => "attaching",
            Self::Ready => "ready",
            Self::Registered => "registered",
            Self::Failed => "failed",
            Self::Closed => "closed",
        })
    }
}

/// Something the layers above need to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Session created and videocall handle attached.
    Ready {
        session_id: SessionId,
        handle_id: HandleId,
    },
    /// Non-error plugin event, with the JSEP it carried.
    Plugin {
        event: PluginEvent,
        jsep: Option<Jsep>,
    },
    /// A request failed (gateway error, plugin error or deadline).
    RequestFailed {
        kind: TransactionKind,
        error: SignalError,
    },
    /// Gateway error not correlated to anything we sent.
    AsyncError(SignalError),
    WebrtcUp,
    /// Gateway tore down the PeerConnection.
    MediaHangup { reason: Option<String> },
    RemoteCandidate(TrickleCandidate),
    Media {
        medium: Option<String>,
        receiving: bool,
    },
    SlowLink {
        medium: Option<String>,
        uplink: bool,
        lost: u64,
    },
    /// Session is over. `None` for an orderly local shutdown.
    Ended(Option<SignalError>),
}

struct DeferredRegister {
    username: String,
    resolver: Option<Resolver>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub plugin: String,
    pub transaction_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            plugin: VIDEOCALL_PLUGIN.to_string(),
            transaction_timeout: super::transaction::DEFAULT_TRANSACTION_TIMEOUT,
        }
    }
}

pub struct SessionManager {
    state: SessionState,
    plugin: String,
    session_id: Option<SessionId>,
    handle_id: Option<HandleId>,
    transactions: TransactionTable,
    deferred_register: Option<DeferredRegister>,
    username: Option<String>,
    /// Peer of the one call the videocall plugin allows.
    active_peer: Option<String>,
    /// Our outbound call has not been accepted yet; late plugin errors are its.
    awaiting_answer: bool,
    outbox: VecDeque<String>,
    events: VecDeque<SessionEvent>,
    ended: bool,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: SessionState::Idle,
            plugin: config.plugin,
            session_id: None,
            handle_id: None,
            transactions: TransactionTable::new(config.transaction_timeout),
            deferred_register: None,
            username: None,
            active_peer: None,
            awaiting_answer: false,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            ended: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        self.handle_id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn active_peer(&self) -> Option<&str> {
        self.active_peer.as_deref()
    }

    pub fn pending_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.transactions.next_deadline()
    }

    /// Frames to put on the wire, in the order they were produced.
    pub fn drain_outbound(&mut self) -> Vec<String> {
        self.outbox.drain(..).collect()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    // -----------------------------------------------------------------------
    // Outbound verbs
    // -----------------------------------------------------------------------

    /// Kick off session creation once the transport is open.
    pub fn start(&mut self, now: Instant) {
        if self.state != SessionState::Idle {
            tracing::warn!("start() ignored in state {}", self.state);
            return;
        }
        tracing::info!("Creating Janus session");
        self.state = SessionState::CreatingSession;
        let transaction = self.begin(TransactionKind::Create, now, None);
        self.push(Request::Create { transaction });
    }

    /// Claim `username`. Deferred until the handle is attached.
    pub fn register(
        &mut self,
        username: &str,
        now: Instant,
        resolver: Option<Resolver>,
    ) -> Result<(), SignalError> {
        match self.state {
            SessionState::Idle | SessionState::CreatingSession | SessionState::Attaching => {
                tracing::info!("Deferring register({}) until the handle is attached", username);
                if let Some(previous) = self.deferred_register.take() {
                    if let Some(tx) = previous.resolver {
                        let _ = tx.send(Err(SignalError::Cancelled));
                    }
                }
                self.deferred_register = Some(DeferredRegister {
                    username: username.to_string(),
                    resolver,
                });
                Ok(())
            }
            SessionState::Ready | SessionState::Registered => {
                self.send_register(username, now, resolver);
                Ok(())
            }
            SessionState::Failed | SessionState::Closed => {
                refuse(resolver, SignalError::invalid_state(self.state, "register"))
            }
        }
    }

    /// Place a call to `peer` with the local offer.
    pub fn call(
        &mut self,
        peer: &str,
        jsep: Jsep,
        now: Instant,
        resolver: Option<Resolver>,
    ) -> Result<(), SignalError> {
        if self.state != SessionState::Registered {
            return refuse(
                resolver,
                SignalError::NotRegistered(format!("cannot call {} while {}", peer, self.state)),
            );
        }
        if let Some(current) = &self.active_peer {
            let err = SignalError::InvalidState {
                from: format!("in a call with {}", current),
                action: "place a second call",
            };
            return refuse(resolver, err);
        }
        if jsep.kind != SdpType::Offer {
            return refuse(
                resolver,
                SignalError::invalid_state(
                    format_args!("holding an {} instead of an offer", jsep.kind),
                    "call",
                ),
            );
        }
        self.send_message(
            TransactionKind::Call,
            PluginRequest::Call {
                username: peer.to_string(),
            },
            Some(jsep),
            now,
            resolver,
        )?;
        self.active_peer = Some(peer.to_string());
        self.awaiting_answer = true;
        Ok(())
    }

    /// Answer the pending incoming call.
    pub fn accept(
        &mut self,
        jsep: Jsep,
        now: Instant,
        resolver: Option<Resolver>,
    ) -> Result<(), SignalError> {
        if self.state != SessionState::Registered {
            return refuse(
                resolver,
                SignalError::NotRegistered(format!("cannot accept while {}", self.state)),
            );
        }
        if jsep.kind != SdpType::Answer {
            return refuse(
                resolver,
                SignalError::invalid_state(
                    format_args!("holding an {} instead of an answer", jsep.kind),
                    "accept",
                ),
            );
        }
        self.send_message(TransactionKind::Accept, PluginRequest::Accept, Some(jsep), now, resolver)
    }

    /// Hang up the current call. Fire-and-forget; a no-op without a handle.
    pub fn hangup(&mut self, now: Instant) {
        self.clear_call();
        if !self.state.is_attached() {
            tracing::debug!("hangup() without an attached handle, nothing to send");
            return;
        }
        if let Err(e) = self.send_message(TransactionKind::Hangup, PluginRequest::Hangup, None, now, None)
        {
            tracing::warn!("Could not send hangup: {}", e);
        }
    }

    /// Turn away `peer`'s incoming call while keeping our own call, if any.
    pub fn decline(&mut self, peer: &str, now: Instant) {
        if self.active_peer.as_deref() == Some(peer) {
            self.clear_call();
        }
        if !self.state.is_attached() {
            return;
        }
        tracing::info!("Declining call from {}", peer);
        if let Err(e) = self.send_message(TransactionKind::Hangup, PluginRequest::Hangup, None, now, None)
        {
            tracing::warn!("Could not decline {}: {}", peer, e);
        }
    }

    /// Ask the plugin for the list of registered users.
    pub fn list(&mut self, now: Instant, resolver: Option<Resolver>) -> Result<(), SignalError> {
        if !self.state.is_attached() {
            return refuse(resolver, SignalError::invalid_state(self.state, "list peers"));
        }
        self.send_message(TransactionKind::List, PluginRequest::List, None, now, resolver)
    }

    /// Tweak media of the current call (`set` request).
    pub fn configure(
        &mut self,
        settings: CallSettings,
        now: Instant,
        resolver: Option<Resolver>,
    ) -> Result<(), SignalError> {
        if self.state != SessionState::Registered {
            return refuse(
                resolver,
                SignalError::NotRegistered(format!(
                    "cannot change call settings while {}",
                    self.state
                )),
            );
        }
        self.send_message(TransactionKind::Set, PluginRequest::Set(settings), None, now, resolver)
    }

    /// Forward one local ICE candidate, or the end-of-candidates sentinel.
    pub fn trickle(&mut self, candidate: TrickleCandidate, now: Instant) -> Result<(), SignalError> {
        let (session_id, handle_id) = self.attached_ids("trickle")?;
        let transaction = self.begin(TransactionKind::Trickle, now, None);
        self.push(Request::Trickle {
            session_id,
            handle_id,
            transaction,
            candidate,
        });
        Ok(())
    }

    /// Keep the gateway session alive. Returns whether a frame was queued.
    pub fn keepalive(&mut self, now: Instant) -> bool {
        let session_id = match self.session_id {
            Some(id) if self.state.is_attached() => id,
            _ => return false,
        };
        let transaction = self.begin(TransactionKind::Keepalive, now, None);
        self.push(Request::Keepalive {
            session_id,
            transaction,
        });
        true
    }

    /// Orderly teardown: detach the handle and destroy the session. Replies
    /// are not awaited; the caller closes the transport right after.
    pub fn shutdown(&mut self, now: Instant) {
        if let (Some(session_id), Some(handle_id)) = (self.session_id, self.handle_id) {
            if self.state.is_attached() {
                let transaction = self.begin(TransactionKind::Detach, now, None);
                self.push(Request::Detach {
                    session_id,
                    handle_id,
                    transaction,
                });
            }
        }
        if let Some(session_id) = self.session_id {
            if !self.state.is_terminal() {
                let transaction = self.begin(TransactionKind::Destroy, now, None);
                self.push(Request::Destroy {
                    session_id,
                    transaction,
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Transport went away. Cancels everything and ends the session.
    pub fn on_transport_closed(&mut self, code: u16, reason: &str, remote: bool) {
        let error = if code == CLOSE_NORMAL && !remote {
            None
        } else {
            Some(SignalError::TransportClosedUnexpectedly {
                code,
                reason: reason.to_string(),
            })
        };
        if !self.state.is_terminal() {
            tracing::info!("Transport closed ({}): session {} -> closed", code, self.state);
        }
        self.state = SessionState::Closed;
        self.end(error);
    }

    /// Expire overdue transactions.
    pub fn poll_timeouts(&mut self, now: Instant) {
        for (_, kind) in self.transactions.expire(now) {
            match kind {
                TransactionKind::Create | TransactionKind::Attach => {
                    self.fail(SignalError::GatewayTimeout);
                }
                TransactionKind::Register
                | TransactionKind::Call
                | TransactionKind::Accept
                | TransactionKind::List
                | TransactionKind::Set => {
                    self.failed_request(kind, SignalError::GatewayTimeout);
                }
                TransactionKind::Hangup
                | TransactionKind::Trickle
                | TransactionKind::Keepalive
                | TransactionKind::Detach
                | TransactionKind::Destroy => {}
            }
        }
    }

    /// Feed one text frame from the gateway.
    pub fn on_text(&mut self, text: &str, now: Instant) {
        if self.state.is_terminal() {
            tracing::debug!("Dropping frame received after session end");
            return;
        }
        let frame = match Inbound::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping unparseable frame: {} ({})", e, text);
                return;
            }
        };

        if let (Some(ours), Some(theirs)) = (self.session_id, frame.session_id) {
            if ours.0 != theirs {
                tracing::warn!(
                    "Dropping frame for session {} (ours is {})",
                    theirs,
                    ours
                );
                return;
            }
        }

        match frame.janus {
            JanusKind::Success => self.on_success(frame, now),
            JanusKind::Ack => {
                if let Some(txn) = frame.transaction.as_deref() {
                    match self.transactions.ack(txn, now) {
                        AckOutcome::Extended(kind) => tracing::debug!("{} acknowledged", kind),
                        AckOutcome::Completed(_) => {}
                        AckOutcome::Unknown => tracing::debug!("Ack for unknown transaction {}", txn),
                    }
                }
            }
            JanusKind::Error => self.on_error(frame),
            JanusKind::Event => self.on_event(frame),
            JanusKind::Webrtcup => {
                tracing::info!("PeerConnection is up (handle {:?})", frame.sender);
                self.events.push_back(SessionEvent::WebrtcUp);
            }
            JanusKind::Hangup => {
                tracing::info!("Gateway hung up the PeerConnection: {:?}", frame.reason);
                self.clear_call();
                self.events.push_back(SessionEvent::MediaHangup {
                    reason: frame.reason,
                });
            }
            JanusKind::Detached => {
                tracing::warn!("Handle {:?} detached by the gateway", frame.sender);
                self.handle_id = None;
                self.fail(SignalError::SessionLost("plugin handle detached".into()));
            }
            JanusKind::Timeout => {
                tracing::warn!("Gateway timed out session {:?}", self.session_id);
                self.state = SessionState::Closed;
                self.end(Some(SignalError::SessionLost("session timed out".into())));
            }
            JanusKind::Media => self.events.push_back(SessionEvent::Media {
                medium: frame.media_type,
                receiving: frame.receiving.unwrap_or(false),
            }),
            JanusKind::Slowlink => self.events.push_back(SessionEvent::SlowLink {
                medium: frame.media,
                uplink: frame.uplink.unwrap_or(false),
                lost: frame.lost.unwrap_or(0),
            }),
            JanusKind::Trickle => match frame.candidate {
                Some(candidate) => self
                    .events
                    .push_back(SessionEvent::RemoteCandidate(candidate)),
                None => tracing::debug!("Trickle frame without a candidate"),
            },
            JanusKind::Unknown => tracing::debug!("Ignoring frame: {}", text),
        }
    }

    fn on_success(&mut self, frame: Inbound, now: Instant) {
        let txn = frame.transaction.as_deref().unwrap_or_default();
        let kind = self.transactions.kind_of(txn);
        let data_id = frame.data_id();

        let is_create = kind == Some(TransactionKind::Create)
            || (kind.is_none()
                && frame.session_id.is_none()
                && data_id.is_some()
                && self.state == SessionState::CreatingSession);
        let is_attach = kind == Some(TransactionKind::Attach)
            || (kind.is_none()
                && frame.session_id.is_some()
                && data_id.is_some()
                && self.state == SessionState::Attaching);

        if is_create {
            self.transactions.resolve(txn, Ok(frame.data.clone().unwrap_or_default()));
            self.on_session_created(data_id, now);
        } else if is_attach {
            self.transactions.resolve(txn, Ok(frame.data.clone().unwrap_or_default()));
            self.on_handle_attached(data_id, now);
        } else {
            // A success without data is an empty-body success.
            let data = frame.data.unwrap_or(Value::Null);
            if self.transactions.resolve(txn, Ok(data)).is_none() {
                tracing::debug!("Success for unknown transaction {:?}", frame.transaction);
            }
        }
    }

    fn on_session_created(&mut self, id: Option<u64>, now: Instant) {
        if self.state != SessionState::CreatingSession {
            tracing::warn!("Unexpected session-create reply in state {}", self.state);
            return;
        }
        let id = match id {
            Some(id) if id != 0 => SessionId(id),
            other => {
                self.fail(SignalError::ProtocolParse(format!(
                    "invalid session id {:?}",
                    other
                )));
                return;
            }
        };
        tracing::info!("Session created: {}", id);
        self.session_id = Some(id);
        self.state = SessionState::Attaching;
        let transaction = self.begin(TransactionKind::Attach, now, None);
        self.push(Request::Attach {
            session_id: id,
            plugin: self.plugin.clone(),
            transaction,
        });
    }

    fn on_handle_attached(&mut self, id: Option<u64>, now: Instant) {
        if self.state != SessionState::Attaching {
            // Exactly one handle per session.
            tracing::warn!("Unexpected attach reply in state {}", self.state);
            return;
        }
        let (session_id, id) = match (self.session_id, id) {
            (Some(session_id), Some(id)) if id != 0 => (session_id, HandleId(id)),
            (_, other) => {
                self.fail(SignalError::ProtocolParse(format!(
                    "invalid handle id {:?}",
                    other
                )));
                return;
            }
        };
        tracing::info!("Attached to {}, handle {}", self.plugin, id);
        self.handle_id = Some(id);
        self.state = SessionState::Ready;
        self.events.push_back(SessionEvent::Ready {
            session_id,
            handle_id: id,
        });

        if let Some(deferred) = self.deferred_register.take() {
            self.send_register(&deferred.username, now, deferred.resolver);
        }
    }

    fn on_error(&mut self, frame: Inbound) {
        let (code, reason) = frame
            .error
            .map(|e| (e.code, e.reason))
            .unwrap_or((0, "unspecified gateway error".to_string()));
        let error = SignalError::Gateway { code, reason };
        tracing::warn!("Gateway error: {}", error);

        let txn = frame.transaction.as_deref().unwrap_or_default();
        match self.transactions.resolve(txn, Err(error.clone())) {
            Some(TransactionKind::Create) | Some(TransactionKind::Attach) => self.fail(error),
            Some(kind) => self.failed_request(kind, error),
            None => self.events.push_back(SessionEvent::AsyncError(error)),
        }
    }

    fn on_event(&mut self, frame: Inbound) {
        let plugindata = match frame.plugindata {
            Some(pd) => pd,
            None => {
                tracing::debug!("Ignoring event without plugindata");
                return;
            }
        };
        let event = match PluginEvent::from_data(&plugindata.data) {
            Some(event) => event,
            None => {
                tracing::debug!("Ignoring plugin event without result: {}", plugindata.data);
                return;
            }
        };
        let txn = frame.transaction.as_deref().unwrap_or_default();

        if let PluginEvent::Error { code, reason } = event {
            // Uncorrelated plugin errors: before registration they can only be
            // about registering, afterwards about a call still ringing out.
            let kind = match self.transactions.kind_of(txn) {
                Some(kind) => kind,
                None if self.state != SessionState::Registered => TransactionKind::Register,
                None if self.awaiting_answer => TransactionKind::Call,
                None => {
                    let error = SignalError::Gateway { code, reason };
                    tracing::warn!("Plugin error outside any request: {}", error);
                    self.events.push_back(SessionEvent::AsyncError(error));
                    return;
                }
            };
            let error = match kind {
                TransactionKind::Register => {
                    SignalError::NotRegistered(format!("{} ({})", reason, code))
                }
                TransactionKind::Call => {
                    SignalError::PeerUnavailable(format!("{} ({})", reason, code))
                }
                _ => SignalError::Gateway { code, reason },
            };
            tracing::warn!("Plugin rejected {}: {}", kind, error);
            self.transactions.resolve(txn, Err(error.clone()));
            self.failed_request(kind, error);
            return;
        }

        self.transactions
            .resolve(txn, Ok(plugindata.data.clone()));

        match &event {
            PluginEvent::Registered { username } => {
                tracing::info!("Registered as {}", username);
                self.username = Some(username.clone());
                if self.state == SessionState::Ready {
                    self.state = SessionState::Registered;
                }
            }
            PluginEvent::Accepted { .. } => self.awaiting_answer = false,
            PluginEvent::IncomingCall { username } => {
                if self.active_peer.is_none() {
                    self.active_peer = Some(username.clone());
                }
            }
            PluginEvent::Hangup { .. } => self.clear_call(),
            _ => {}
        }

        self.events.push_back(SessionEvent::Plugin {
            event,
            jsep: frame.jsep,
        });
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn begin(&mut self, kind: TransactionKind, now: Instant, resolver: Option<Resolver>) -> String {
        self.transactions.begin(kind, now, resolver).to_string()
    }

    fn push(&mut self, request: Request) {
        self.outbox.push_back(request.to_text());
    }

    fn attached_ids(&self, action: &'static str) -> Result<(SessionId, HandleId), SignalError> {
        match (self.session_id, self.handle_id) {
            (Some(s), Some(h)) if self.state.is_attached() => Ok((s, h)),
            _ => Err(SignalError::invalid_state(self.state, action)),
        }
    }

    fn send_register(&mut self, username: &str, now: Instant, resolver: Option<Resolver>) {
        tracing::info!("Registering as {}", username);
        if let Err(e) = self.send_message(
            TransactionKind::Register,
            PluginRequest::Register {
                username: username.to_string(),
            },
            None,
            now,
            resolver,
        ) {
            tracing::warn!("Could not send register: {}", e);
        }
    }

    fn send_message(
        &mut self,
        kind: TransactionKind,
        body: PluginRequest,
        jsep: Option<Jsep>,
        now: Instant,
        resolver: Option<Resolver>,
    ) -> Result<(), SignalError> {
        let (session_id, handle_id) = match self.attached_ids("send a plugin message") {
            Ok(ids) => ids,
            Err(e) => return refuse(resolver, e),
        };
        let transaction = self.begin(kind, now, resolver);
        self.push(Request::Message {
            session_id,
            handle_id,
            transaction,
            body,
            jsep,
        });
        Ok(())
    }

    /// A request will not complete: undo what it claimed, then report it.
    fn failed_request(&mut self, kind: TransactionKind, error: SignalError) {
        match kind {
            TransactionKind::Register => self.username = None,
            // A refused accept still leaves the incoming call on the gateway;
            // the call layer hangs it up.
            TransactionKind::Call | TransactionKind::Accept => self.clear_call(),
            _ => {}
        }
        self.events
            .push_back(SessionEvent::RequestFailed { kind, error });
    }

    fn clear_call(&mut self) {
        self.active_peer = None;
        self.awaiting_answer = false;
    }

    fn fail(&mut self, error: SignalError) {
        tracing::warn!("Session {} -> failed: {}", self.state, error);
        self.state = SessionState::Failed;
        self.end(Some(error));
    }

    /// Session-fatal teardown: cancel all pending requests, report once.
    fn end(&mut self, error: Option<SignalError>) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.clear_call();
        let cancelled = self.transactions.cancel_all(SignalError::Cancelled);
        if cancelled > 0 {
            tracing::debug!("Cancelled {} pending transaction(s)", cancelled);
        }
        if let Some(deferred) = self.deferred_register.take() {
            if let Some(tx) = deferred.resolver {
                let _ = tx.send(Err(SignalError::Cancelled));
            }
        }
        self.events.push_back(SessionEvent::Ended(error));
    }
}
