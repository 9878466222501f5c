//! The client event loop.
//!
//! One task owns the transport, the session manager and the negotiation
//! controller. Transport events, media-engine callbacks, user commands and
//! timers are serialized through a single `select!`, so every state
//! transition happens on this task.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::calling::engine::EngineEvent;
use crate::calling::{MediaEngine, NegotiationConfig, NegotiationController};
use crate::error::SignalError;
use crate::event::ClientEvent;
use crate::janus::envelope::{CallSettings, PluginEvent};
use crate::janus::session::{SessionConfig, SessionEvent, SessionManager};
use crate::janus::transaction::{Reply, Resolver, TransactionKind};
use crate::transport::{Transport, TransportEvent, CLOSE_ABNORMAL, CLOSE_NORMAL};

/// Default `keepalive` period; the gateway reaps sessions after 60 s.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub keepalive_interval: Duration,
    pub session: SessionConfig,
    pub negotiation: NegotiationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            session: SessionConfig::default(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

enum Command {
    Register { username: String, reply: Resolver },
    PlaceCall { peer: String, reply: Resolver },
    AcceptIncoming { reply: Resolver },
    RejectIncoming { reply: oneshot::Sender<Result<(), SignalError>> },
    Hangup,
    ListPeers { reply: Resolver },
    Configure { settings: CallSettings, reply: Resolver },
    Shutdown,
}

/// Cloneable front door to a running [`Client`].
///
/// Awaitable verbs resolve on the terminal gateway reply or the transaction
/// deadline. They fail with `Cancelled` once the client is gone.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    async fn request(&self, make: impl FnOnce(Resolver) -> Command) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SignalError::Cancelled)?;
        rx.await.map_err(|_| SignalError::Cancelled)?
    }

    pub async fn register(&self, username: &str) -> Result<(), SignalError> {
        let username = username.to_string();
        self.request(|reply| Command::Register { username, reply })
            .await
            .map(drop)
    }

    pub async fn place_call(&self, peer: &str) -> Result<(), SignalError> {
        let peer = peer.to_string();
        self.request(|reply| Command::PlaceCall { peer, reply })
            .await
            .map(drop)
    }

    pub async fn accept_incoming(&self) -> Result<(), SignalError> {
        self.request(|reply| Command::AcceptIncoming { reply })
            .await
            .map(drop)
    }

    pub async fn reject_incoming(&self) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RejectIncoming { reply: tx })
            .map_err(|_| SignalError::Cancelled)?;
        rx.await.map_err(|_| SignalError::Cancelled)?
    }

    /// Fire-and-forget.
    pub fn hangup(&self) {
        let _ = self.commands.send(Command::Hangup);
    }

    /// Usernames currently registered with the plugin.
    pub async fn list_peers(&self) -> Result<Vec<String>, SignalError> {
        let data = self.request(|reply| Command::ListPeers { reply }).await?;
        match PluginEvent::from_data(&data) {
            Some(PluginEvent::List(peers)) => Ok(peers),
            _ => Err(SignalError::ProtocolParse(format!(
                "unexpected list reply: {}",
                data
            ))),
        }
    }

    pub async fn configure(&self, settings: CallSettings) -> Result<(), SignalError> {
        self.request(|reply| Command::Configure { settings, reply })
            .await
            .map(drop)
    }

    /// Hang up, detach, destroy the session and close the transport.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

pub struct Client<T: Transport, E: MediaEngine> {
    transport: T,
    session: SessionManager,
    controller: NegotiationController<E>,
    commands: mpsc::UnboundedReceiver<Command>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    events: mpsc::UnboundedSender<ClientEvent>,
    keepalive_interval: Duration,
    /// Set once the session ended: `None` inside for an orderly shutdown.
    outcome: Option<Option<SignalError>>,
}

impl<T: Transport, E: MediaEngine> Client<T, E> {
    pub fn new(
        transport: T,
        mut engine: E,
        config: ClientConfig,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        engine.subscribe(engine_tx);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let client = Self {
            transport,
            session: SessionManager::new(config.session),
            controller: NegotiationController::new(engine, config.negotiation),
            commands: command_rx,
            engine_events: engine_rx,
            events: event_tx,
            keepalive_interval: config.keepalive_interval,
            outcome: None,
        };
        (
            client,
            ClientHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Run until the session ends. `Ok` after an orderly shutdown.
    pub async fn run(mut self) -> Result<(), SignalError> {
        let period = self.keepalive_interval;
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.session.next_deadline();
            tokio::select! {
                event = self.transport.next_event() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        if !self.session.state().is_terminal() {
                            self.session.on_transport_closed(CLOSE_ABNORMAL, "transport ended", true);
                        }
                    }
                },
                Some(command) = self.commands.recv() => self.on_command(command).await,
                Some(event) = self.engine_events.recv() => {
                    self.controller
                        .on_engine_event(&mut self.session, event, Instant::now())
                        .await;
                }
                _ = keepalive.tick() => {
                    if self.session.keepalive(Instant::now()) {
                        tracing::trace!("Keepalive queued");
                    }
                }
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.session.poll_timeouts(Instant::now());
                }
            }

            self.pump().await;

            if let Some(outcome) = self.outcome.take() {
                self.controller.close().await;
                self.transport.close(CLOSE_NORMAL, "session ended").await;
                return match outcome {
                    None => Ok(()),
                    Some(e) => Err(e),
                };
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let now = Instant::now();
        match event {
            TransportEvent::Opened => {
                tracing::info!("Transport open");
                self.session.start(now);
            }
            TransportEvent::Message(text) => {
                tracing::debug!("<< {}", text);
                self.session.on_text(&text, now);
            }
            TransportEvent::Closed {
                code,
                reason,
                remote,
            } => self.session.on_transport_closed(code, &reason, remote),
            TransportEvent::Error { kind, detail } => {
                tracing::warn!("Transport {}: {}", kind, detail);
                self.emit(ClientEvent::Error { kind, detail });
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        let now = Instant::now();
        let result = match command {
            Command::Register { username, reply } => {
                self.session.register(&username, now, Some(reply))
            }
            Command::PlaceCall { peer, reply } => {
                self.controller
                    .place_call(&mut self.session, &peer, now, Some(reply))
                    .await
            }
            Command::AcceptIncoming { reply } => {
                self.controller
                    .accept_incoming(&mut self.session, now, Some(reply))
                    .await
            }
            Command::RejectIncoming { reply } => {
                let result = self.controller.reject_incoming(&mut self.session, now).await;
                let _ = reply.send(result.clone());
                result
            }
            Command::Hangup => {
                self.controller.hangup(&mut self.session, now).await;
                Ok(())
            }
            Command::ListPeers { reply } => self.session.list(now, Some(reply)),
            Command::Configure { settings, reply } => {
                self.session.configure(settings, now, Some(reply))
            }
            Command::Shutdown => {
                self.shutdown(now).await;
                Ok(())
            }
        };
        // The caller already got the error through its reply channel.
        if let Err(e) = result {
            tracing::debug!("Command refused: {}", e);
        }
    }

    async fn shutdown(&mut self, now: Instant) {
        tracing::info!("Shutting down");
        self.controller.hangup(&mut self.session, now).await;
        self.session.shutdown(now);
        self.flush_outbound().await;
        self.transport.close(CLOSE_NORMAL, "shutdown").await;
        self.session.on_transport_closed(CLOSE_NORMAL, "shutdown", false);
    }

    /// Route everything the session produced, then put frames on the wire.
    async fn pump(&mut self) {
        self.flush_notices();
        while let Some(event) = self.session.poll_event() {
            self.on_session_event(&event);
            self.controller
                .on_session_event(&mut self.session, &event, Instant::now())
                .await;
            self.flush_notices();
        }
        self.flush_outbound().await;
    }

    fn on_session_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Ready {
                session_id,
                handle_id,
            } => self.emit(ClientEvent::Connected {
                session_id: *session_id,
                handle_id: *handle_id,
            }),
            SessionEvent::Plugin {
                event: PluginEvent::Registered { username },
                ..
            } => self.emit(ClientEvent::Registered {
                username: username.clone(),
            }),
            SessionEvent::Plugin {
                event: PluginEvent::List(peers),
                ..
            } => self.emit(ClientEvent::Peers(peers.clone())),
            SessionEvent::Plugin { .. } => {}
            // Call and accept failures end the call instead.
            SessionEvent::RequestFailed {
                kind: TransactionKind::Call | TransactionKind::Accept,
                ..
            } => {}
            SessionEvent::RequestFailed { error, .. } | SessionEvent::AsyncError(error) => {
                self.emit(ClientEvent::error(error))
            }
            SessionEvent::Media { medium, receiving } => self.emit(ClientEvent::MediaState {
                medium: medium.clone(),
                receiving: *receiving,
            }),
            SessionEvent::SlowLink {
                medium,
                uplink,
                lost,
            } => self.emit(ClientEvent::SlowLink {
                medium: medium.clone(),
                uplink: *uplink,
                lost: *lost,
            }),
            SessionEvent::Ended(error) => {
                self.emit(ClientEvent::Disconnected {
                    error: error.clone(),
                });
                self.outcome = Some(error.clone());
            }
            SessionEvent::WebrtcUp
            | SessionEvent::MediaHangup { .. }
            | SessionEvent::RemoteCandidate(_) => {}
        }
    }

    fn flush_notices(&mut self) {
        for event in self.controller.drain_notices() {
            self.emit(event);
        }
    }

    async fn flush_outbound(&mut self) {
        for frame in self.session.drain_outbound() {
            tracing::debug!(">> {}", frame);
            if let Err(e) = self.transport.send(&frame).await {
                tracing::warn!("Dropping outbound frame: {}", e);
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        tracing::debug!("Event: {}", event);
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::engine::testing::{Journal, RecordingEngine};
    use crate::event::CallEndReason;
    use crate::janus::envelope::{HandleId, SessionId, VIDEOCALL_PLUGIN};
    use crate::transport::TransportState;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::task::JoinHandle;

    /// In-memory transport fed by the test.
    struct ScriptedTransport {
        state: TransportState,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn state(&self) -> TransportState {
            self.state
        }

        async fn send(&mut self, text: &str) -> Result<(), SignalError> {
            if self.state != TransportState::Open {
                return Err(SignalError::TransportNotOpen);
            }
            let _ = self.outbound.send(text.to_string());
            Ok(())
        }

        async fn next_event(&mut self) -> Option<TransportEvent> {
            if self.state == TransportState::Closed {
                return None;
            }
            match self.inbound.recv().await {
                Some(event) => {
                    match &event {
                        TransportEvent::Opened => self.state = TransportState::Open,
                        TransportEvent::Closed { .. } => self.state = TransportState::Closed,
                        _ => {}
                    }
                    Some(event)
                }
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self, _code: u16, _reason: &str) {
            self.state = TransportState::Closed;
        }
    }

    struct Gateway {
        tx: mpsc::UnboundedSender<TransportEvent>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl Gateway {
        async fn raw_frame(&mut self) -> Value {
            let text = self.rx.recv().await.expect("client hung up");
            serde_json::from_str(&text).unwrap()
        }

        /// Next frame that is not a keepalive or a trickle.
        async fn next_frame(&mut self) -> Value {
            loop {
                let frame = self.raw_frame().await;
                if frame["janus"] != "keepalive" && frame["janus"] != "trickle" {
                    return frame;
                }
            }
        }

        fn send(&self, frame: Value) {
            self.tx.send(TransportEvent::Message(frame.to_string())).unwrap();
        }

        fn close(&self, code: u16, reason: &str) {
            self.tx
                .send(TransportEvent::Closed {
                    code,
                    reason: reason.into(),
                    remote: true,
                })
                .unwrap();
        }

        /// Open, create session 100, attach handle 200.
        async fn handshake(&mut self) {
            self.tx.send(TransportEvent::Opened).unwrap();
            let create = self.next_frame().await;
            assert_eq!(create["janus"], "create");
            self.send(json!({"janus":"success","transaction":create["transaction"],"data":{"id":100}}));
            let attach = self.next_frame().await;
            assert_eq!(attach["janus"], "attach");
            assert_eq!(attach["session_id"], 100);
            self.send(json!({"janus":"success","transaction":attach["transaction"],
                "session_id":100,"data":{"id":200}}));
        }

        fn plugin_event(&self, transaction: &Value, result: Value, jsep: Option<Value>) {
            let mut frame = json!({
                "janus": "event", "session_id": 100, "sender": 200,
                "plugindata": {"plugin": VIDEOCALL_PLUGIN, "data": {"videocall": "event", "result": result}}
            });
            if !transaction.is_null() {
                frame["transaction"] = transaction.clone();
            }
            if let Some(jsep) = jsep {
                frame["jsep"] = jsep;
            }
            self.send(frame);
        }

        fn trickle(&self, candidate: &str) {
            self.send(json!({"janus":"trickle","session_id":100,"sender":200,
                "candidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":candidate}}));
        }
    }

    struct Harness {
        gw: Gateway,
        handle: ClientHandle,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        journal: Journal,
        task: JoinHandle<Result<(), SignalError>>,
    }

    impl Harness {
        async fn event(&mut self) -> ClientEvent {
            self.events.recv().await.expect("event stream ended")
        }
    }

    fn start() -> Harness {
        let (engine, journal) = RecordingEngine::new();
        start_with(engine, journal)
    }

    fn start_with(engine: RecordingEngine, journal: Journal) -> Harness {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            state: TransportState::Connecting,
            inbound: in_rx,
            outbound: out_tx,
        };
        let (client, handle, events) = Client::new(transport, engine, ClientConfig::default());
        Harness {
            gw: Gateway {
                tx: in_tx,
                rx: out_rx,
            },
            handle,
            events,
            journal,
            task: tokio::spawn(client.run()),
        }
    }

    /// Handshake plus registration as alice.
    async fn registered() -> Harness {
        register_alice(start()).await
    }

    async fn register_alice(mut h: Harness) -> Harness {
        h.gw.handshake().await;
        assert_eq!(
            h.event().await,
            ClientEvent::Connected {
                session_id: SessionId(100),
                handle_id: HandleId(200)
            }
        );
        let handle = h.handle.clone();
        let reg = tokio::spawn(async move { handle.register("alice").await });
        let frame = h.gw.next_frame().await;
        assert_eq!(frame["body"], json!({"request":"register","username":"alice"}));
        h.gw.plugin_event(
            &frame["transaction"],
            json!({"event":"registered","username":"alice"}),
            None,
        );
        reg.await.unwrap().unwrap();
        assert_eq!(
            h.event().await,
            ClientEvent::Registered {
                username: "alice".into()
            }
        );
        h
    }

    /// Registered, then an outbound call to bob answered with "A".
    async fn in_call_with_bob() -> Harness {
        let mut h = registered().await;
        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.place_call("bob").await });
        let frame = h.gw.next_frame().await;
        assert_eq!(frame["body"], json!({"request":"call","username":"bob"}));
        h.gw.plugin_event(&frame["transaction"], json!({"event":"calling"}), None);
        call.await.unwrap().unwrap();
        h.gw.plugin_event(
            &Value::Null,
            json!({"event":"accepted","username":"bob"}),
            Some(json!({"type":"answer","sdp":"A"})),
        );
        assert_eq!(h.event().await, ClientEvent::CallAccepted { peer: "bob".into() });
        h
    }

    #[tokio::test]
    async fn test_outbound_call_happy_path() {
        let mut h = in_call_with_bob().await;
        assert!(h
            .journal
            .entries()
            .contains(&"set_remote_description:answer:A".to_string()));

        h.gw.send(json!({"janus":"webrtcup","session_id":100,"sender":200}));
        assert_eq!(
            h.event().await,
            ClientEvent::CallEstablished { peer: "bob".into() }
        );

        h.handle.shutdown();
        let kinds: Vec<Value> = vec![
            h.gw.next_frame().await,
            h.gw.next_frame().await,
            h.gw.next_frame().await,
        ];
        assert_eq!(kinds[0]["body"], json!({"request":"hangup"}));
        assert_eq!(kinds[1]["janus"], "detach");
        assert_eq!(kinds[2]["janus"], "destroy");
        assert_eq!(
            h.event().await,
            ClientEvent::CallEnded {
                peer: Some("bob".into()),
                reason: CallEndReason::LocalHangup
            }
        );
        assert_eq!(h.event().await, ClientEvent::Disconnected { error: None });
        assert_eq!(h.task.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_inbound_call_accepted() {
        let mut h = registered().await;
        h.gw.plugin_event(
            &Value::Null,
            json!({"event":"incomingcall","username":"carol"}),
            Some(json!({"type":"offer","sdp":"O"})),
        );
        assert_eq!(
            h.event().await,
            ClientEvent::IncomingCall {
                peer: "carol".into()
            }
        );

        let handle = h.handle.clone();
        let accept = tokio::spawn(async move { handle.accept_incoming().await });
        let frame = h.gw.next_frame().await;
        assert_eq!(frame["janus"], "message");
        assert_eq!(frame["session_id"], 100);
        assert_eq!(frame["handle_id"], 200);
        assert_eq!(frame["body"], json!({"request":"accept"}));
        assert_eq!(frame["jsep"], json!({"type":"answer","sdp":"A"}));
        h.gw.plugin_event(
            &frame["transaction"],
            json!({"event":"accepted"}),
            None,
        );
        accept.await.unwrap().unwrap();
        assert_eq!(
            h.event().await,
            ClientEvent::CallAccepted {
                peer: "carol".into()
            }
        );
        let journal = h.journal.entries();
        let remote = journal
            .iter()
            .position(|e| e == "set_remote_description:offer:O")
            .unwrap();
        let answer = journal.iter().position(|e| e == "create_answer").unwrap();
        assert!(remote < answer);
    }

    #[tokio::test]
    async fn test_call_to_unknown_user_ends_call() {
        let mut h = registered().await;
        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.place_call("dave").await });
        let frame = h.gw.next_frame().await;
        h.gw.plugin_event(
            &frame["transaction"],
            json!({"event":"error","error_code":479,"error":"User not found"}),
            None,
        );
        assert!(matches!(
            call.await.unwrap(),
            Err(SignalError::PeerUnavailable(_))
        ));
        match h.event().await {
            ClientEvent::CallEnded {
                peer,
                reason: CallEndReason::Failed(SignalError::PeerUnavailable(detail)),
            } => {
                assert_eq!(peer.as_deref(), Some("dave"));
                assert!(detail.contains("User not found"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.journal.entries().last().map(String::as_str), Some("close"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_timeout_keeps_session() {
        let mut h = start();
        h.gw.handshake().await;
        h.event().await;

        let handle = h.handle.clone();
        let reg = tokio::spawn(async move { handle.register("alice").await });
        h.gw.next_frame().await;
        assert_eq!(reg.await.unwrap(), Err(SignalError::GatewayTimeout));
        assert!(matches!(
            h.event().await,
            ClientEvent::Error {
                kind: "GatewayTimeout",
                ..
            }
        ));

        // Still attached: a retry goes straight out.
        let handle = h.handle.clone();
        tokio::spawn(async move { handle.register("alice").await });
        let frame = h.gw.next_frame().await;
        assert_eq!(frame["body"]["request"], "register");
        assert_eq!(frame["handle_id"], 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_sent_periodically() {
        let mut h = start();
        h.gw.handshake().await;
        h.event().await;
        let frame = h.gw.raw_frame().await;
        assert_eq!(frame["janus"], "keepalive");
        assert_eq!(frame["session_id"], 100);
        h.gw.send(json!({"janus":"ack","session_id":100,"transaction":frame["transaction"]}));
        let frame = h.gw.raw_frame().await;
        assert_eq!(frame["janus"], "keepalive");
    }

    #[tokio::test]
    async fn test_transport_drop_mid_call() {
        let mut h = in_call_with_bob().await;
        let handle = h.handle.clone();
        let list = tokio::spawn(async move { handle.list_peers().await });
        assert_eq!(h.gw.next_frame().await["body"], json!({"request":"list"}));

        h.gw.close(1006, "reset");
        let err = SignalError::TransportClosedUnexpectedly {
            code: 1006,
            reason: "reset".into(),
        };
        assert_eq!(
            h.event().await,
            ClientEvent::Disconnected {
                error: Some(err.clone())
            }
        );
        assert_eq!(
            h.event().await,
            ClientEvent::CallEnded {
                peer: Some("bob".into()),
                reason: CallEndReason::Failed(err.clone())
            }
        );
        assert_eq!(list.await.unwrap(), Err(SignalError::Cancelled));
        assert_eq!(h.journal.entries().last().map(String::as_str), Some("close"));
        assert_eq!(h.task.await.unwrap(), Err(err));

        // The handle outlives the client but every verb is cancelled.
        assert_eq!(h.handle.register("alice").await, Err(SignalError::Cancelled));
    }

    #[tokio::test]
    async fn test_remote_candidates_wait_for_answer() {
        let mut h = registered().await;
        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.place_call("bob").await });
        let frame = h.gw.next_frame().await;
        h.gw.plugin_event(&frame["transaction"], json!({"event":"calling"}), None);
        call.await.unwrap().unwrap();

        h.gw.trickle("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        h.gw.trickle("candidate:2 1 udp 1 10.0.0.2 5000 typ host");
        h.gw.plugin_event(
            &Value::Null,
            json!({"event":"accepted","username":"bob"}),
            Some(json!({"type":"answer","sdp":"A"})),
        );
        h.event().await;
        h.gw.trickle("candidate:3 1 udp 1 10.0.0.3 5000 typ host");
        h.gw.send(json!({"janus":"trickle","session_id":100,"sender":200,"candidate":{"completed":true}}));
        h.gw.send(json!({"janus":"webrtcup","session_id":100,"sender":200}));
        h.event().await;

        let journal = h.journal.entries();
        let start = journal
            .iter()
            .position(|e| e == "set_remote_description:answer:A")
            .unwrap();
        assert_eq!(
            journal[start + 1..],
            [
                "add_ice_candidate:candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
                "add_ice_candidate:candidate:2 1 udp 1 10.0.0.2 5000 typ host".to_string(),
                "add_ice_candidate:candidate:3 1 udp 1 10.0.0.3 5000 typ host".to_string(),
                "add_ice_candidate:completed".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_incoming_call_while_established_is_hung_up() {
        let mut h = in_call_with_bob().await;
        h.gw.send(json!({"janus":"webrtcup","session_id":100,"sender":200}));
        h.event().await;

        h.gw.plugin_event(
            &Value::Null,
            json!({"event":"incomingcall","username":"eve"}),
            Some(json!({"type":"offer","sdp":"O2"})),
        );
        let frame = h.gw.next_frame().await;
        assert_eq!(frame["body"], json!({"request":"hangup"}));

        // The call with bob is untouched.
        let handle = h.handle.clone();
        let peers = tokio::spawn(async move { handle.list_peers().await });
        let list = h.gw.next_frame().await;
        h.gw.plugin_event(&list["transaction"], json!({"list":["alice","bob"]}), None);
        assert_eq!(
            peers.await.unwrap().unwrap(),
            vec!["alice".to_string(), "bob".to_string()]
        );
        assert_eq!(
            h.event().await,
            ClientEvent::Peers(vec!["alice".into(), "bob".into()])
        );
    }

    #[tokio::test]
    async fn test_configure_sends_set() {
        let mut h = registered().await;
        let handle = h.handle.clone();
        let set = tokio::spawn(async move {
            handle
                .configure(CallSettings {
                    bitrate: Some(128_000),
                    ..Default::default()
                })
                .await
        });
        let frame = h.gw.next_frame().await;
        assert_eq!(frame["body"], json!({"request":"set","bitrate":128000}));
        h.gw.plugin_event(&frame["transaction"], json!({"event":"set"}), None);
        assert_eq!(set.await.unwrap(), Ok(()));

        let handle = h.handle.clone();
        let set = tokio::spawn(async move {
            handle
                .configure(CallSettings {
                    video: Some(false),
                    ..Default::default()
                })
                .await
        });
        let frame = h.gw.next_frame().await;
        h.gw.send(json!({
            "janus": "event", "session_id": 100, "sender": 200,
            "transaction": frame["transaction"],
            "plugindata": {"plugin": VIDEOCALL_PLUGIN,
                "data": {"videocall": "event", "error_code": 478, "error": "Invalid element"}}
        }));
        let expected = SignalError::Gateway {
            code: 478,
            reason: "Invalid element".into(),
        };
        assert_eq!(set.await.unwrap(), Err(expected.clone()));
        assert_eq!(h.event().await, ClientEvent::error(&expected));
    }

    #[tokio::test]
    async fn test_second_call_after_failed_accept() {
        let mut h = registered().await;
        h.gw.plugin_event(
            &Value::Null,
            json!({"event":"incomingcall","username":"carol"}),
            Some(json!({"type":"offer","sdp":"O"})),
        );
        assert_eq!(
            h.event().await,
            ClientEvent::IncomingCall {
                peer: "carol".into()
            }
        );

        let handle = h.handle.clone();
        let accept = tokio::spawn(async move { handle.accept_incoming().await });
        let frame = h.gw.next_frame().await;
        assert_eq!(frame["body"], json!({"request":"accept"}));
        h.gw.send(json!({
            "janus": "event", "session_id": 100, "sender": 200,
            "transaction": frame["transaction"],
            "plugindata": {"plugin": VIDEOCALL_PLUGIN,
                "data": {"videocall": "event", "error_code": 478, "error": "Invalid element"}}
        }));
        let expected = SignalError::Gateway {
            code: 478,
            reason: "Invalid element".into(),
        };
        assert_eq!(accept.await.unwrap(), Err(expected.clone()));

        // The gateway still holds carol's call until we hang it up.
        let hangup = h.gw.next_frame().await;
        assert_eq!(hangup["body"], json!({"request":"hangup"}));
        assert_eq!(
            h.event().await,
            ClientEvent::CallEnded {
                peer: Some("carol".into()),
                reason: CallEndReason::Failed(expected)
            }
        );

        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.place_call("bob").await });
        let frame = h.gw.next_frame().await;
        assert_eq!(frame["body"], json!({"request":"call","username":"bob"}));
        h.gw.plugin_event(&frame["transaction"], json!({"event":"calling"}), None);
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_local_candidates_trail_the_offer() {
        let (mut engine, journal) = RecordingEngine::new();
        engine.trickle_on_local = true;
        let mut h = register_alice(start_with(engine, journal)).await;

        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.place_call("bob").await });
        let frame = h.gw.raw_frame().await;
        assert_eq!(frame["body"], json!({"request":"call","username":"bob"}));
        let candidate = h.gw.raw_frame().await;
        assert_eq!(candidate["janus"], "trickle");
        assert_eq!(candidate["handle_id"], 200);
        assert_eq!(
            candidate["candidate"]["candidate"],
            "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host"
        );
        let done = h.gw.raw_frame().await;
        assert_eq!(done["candidate"], json!({"completed": true}));

        h.gw.plugin_event(&frame["transaction"], json!({"event":"calling"}), None);
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reject_without_incoming_call() {
        let h = registered().await;
        assert!(matches!(
            h.handle.reject_incoming().await,
            Err(SignalError::InvalidState { .. })
        ));
        assert!(matches!(
            h.handle.accept_incoming().await,
            Err(SignalError::InvalidState { .. })
        ));
    }
}
