//! The AVS protocol client.
//!
//! Every operation returns as soon as the request is spawned. Results,
//! downchannel directives, state changes and alert timers all funnel into one
//! dispatcher task, which owns the caller's [`ClientHandler`] together with
//! the Speak token and the alert timers. Handler callbacks therefore never
//! run concurrently with each other.

use crate::auth::TokenSource;
use crate::config::AvsConfig;
use crate::directive::Directive;
use crate::downchannel::{ConnectionState, DownchannelEvent, DownchannelStream};
use crate::error::{AvsError, ProtocolError, Result};
use crate::event::EventEnvelope;
use crate::keepalive::{self, KeepaliveScheduler};
use crate::multipart::{
    decode, encode_metadata, encode_metadata_with_audio, extract_boundary, request_content_type,
};
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Receives everything the client produces, always from the dispatcher task
pub trait ClientHandler: Send + 'static {
    fn on_ping(&mut self, result: Result<()>);

    fn on_sync(&mut self, result: Result<()>);

    /// Directives decoded from a recognize response, or why there are none
    fn on_directives(&mut self, result: Result<Vec<Directive>>);

    /// One raw JSON object pushed on the downchannel
    fn on_downchannel_directive(&mut self, json: String);

    fn on_downchannel_state(&mut self, state: ConnectionState, error: Option<AvsError>) {
        match error {
            Some(e) => log::warn!("📡 Downchannel {}: {}", state, e),
            None => log::info!("📡 Downchannel {}", state),
        }
    }

    fn on_event_sent(&mut self, namespace: &str, name: &str, result: Result<()>) {
        match result {
            Ok(()) => log::info!("Sent event {}.{}", namespace, name),
            Err(e) => log::warn!("Send event {}.{} failed: {}", namespace, name, e),
        }
    }

    fn on_alert(&mut self, token: &str) {
        log::info!("⏰ Alert {} is due", token);
    }
}

enum Dispatch {
    Ping(Result<()>),
    Sync(Result<()>),
    Directives(Result<Vec<Directive>>),
    Downchannel {
        stream_id: u64,
        scope: CancellationToken,
        event: DownchannelEvent,
    },
    EventSent {
        namespace: String,
        name: String,
        result: Result<()>,
    },
    ReportSpeech {
        name: &'static str,
        bearer: String,
    },
    AlertDue {
        token: String,
        timer_id: u64,
    },
    SpeakToken(oneshot::Sender<Option<String>>),
    Shutdown,
}

struct EventResponse {
    status: StatusCode,
    content_type: Option<String>,
    body: Vec<u8>,
}

struct DownchannelSlot {
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
}

struct Inner {
    config: AvsConfig,
    runtime: Handle,
    http: Client,
    tokens: Arc<dyn TokenSource>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    /// Serializes event uploads: one outstanding POST per client
    upload_gate: tokio::sync::Mutex<()>,
    downchannel: Mutex<Option<DownchannelSlot>>,
    next_stream_id: AtomicU64,
}

impl Inner {
    fn deliver(&self, message: Dispatch) {
        if self.dispatch.send(message).is_err() {
            log::debug!("Dispatcher is gone, dropping result");
        }
    }

    async fn post_event(
        &self,
        envelope: &EventEnvelope,
        audio: Option<&[u8]>,
        bearer: &str,
    ) -> Result<EventResponse> {
        let metadata = envelope.to_json()?;
        let body = match audio {
            Some(audio) => encode_metadata_with_audio(&metadata, audio),
            None => encode_metadata(&metadata),
        };

        let _gate = self.upload_gate.lock().await;
        log::debug!(
            "POST {}.{} ({} byte body, messageId {})",
            envelope.namespace(),
            envelope.name(),
            body.len(),
            envelope.message_id()
        );

        let response = self
            .http
            .post(self.config.events_url())
            .bearer_auth(bearer)
            .header(CONTENT_TYPE, request_content_type())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();

        log::info!(
            "{}.{} status code: {}",
            envelope.namespace(),
            envelope.name(),
            status.as_u16()
        );

        Ok(EventResponse {
            status,
            content_type,
            body,
        })
    }

    async fn synchronize(&self, bearer: &str) -> Result<()> {
        let envelope = EventEnvelope::synchronize_state();
        let response = self.post_event(&envelope, None, bearer).await?;

        if response.status == StatusCode::NO_CONTENT {
            Ok(())
        } else {
            log::warn!(
                "Sync response: {}",
                String::from_utf8_lossy(&response.body)
            );
            Err(ProtocolError::UnexpectedStatus(response.status.as_u16()).into())
        }
    }

    async fn recognize(&self, audio: &[u8], bearer: &str) -> Result<Vec<Directive>> {
        let envelope = EventEnvelope::recognize();
        log::info!(
            "🎙️ Sending {} bytes of audio (dialogRequestId {})",
            audio.len(),
            envelope.dialog_request_id().unwrap_or_default()
        );

        let response = self.post_event(&envelope, Some(audio), bearer).await?;
        if !response.status.is_success() {
            return Err(ProtocolError::UnexpectedStatus(response.status.as_u16()).into());
        }
        if response.status == StatusCode::NO_CONTENT || response.body.is_empty() {
            return Ok(Vec::new());
        }

        let content_type = response
            .content_type
            .ok_or(ProtocolError::MissingContentType)?;
        let boundary = extract_boundary(&content_type)?;
        let directives = decode(&response.body, &boundary);
        log::info!("📥 Decoded {} directives", directives.len());
        Ok(directives)
    }

    async fn send_event(&self, envelope: &EventEnvelope, bearer: &str) -> Result<()> {
        let response = self.post_event(envelope, None, bearer).await?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedStatus(response.status.as_u16()).into())
        }
    }

    fn spawn_send_event(self: &Arc<Self>, envelope: EventEnvelope, bearer: String) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = inner.send_event(&envelope, &bearer).await;
            inner.deliver(Dispatch::EventSent {
                namespace: envelope.namespace().to_string(),
                name: envelope.name().to_string(),
                result,
            });
        });
    }

    /// Sync device state and start pinging once the downchannel is up
    fn on_downchannel_open(self: &Arc<Self>, scope: &CancellationToken) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = match inner.tokens.bearer_token() {
                Ok(bearer) => inner.synchronize(&bearer).await,
                Err(e) => Err(e),
            };
            inner.deliver(Dispatch::Sync(result));
        });

        let keepalive = KeepaliveScheduler::new(
            self.http.clone(),
            self.config.ping_url(),
            Arc::clone(&self.tokens),
            self.config.ping_interval,
        );
        let dispatch = self.dispatch.clone();
        keepalive.spawn(scope.child_token(), move |result| {
            let _ = dispatch.send(Dispatch::Ping(result));
        });
    }
}

/// Client for the AVS ping, downchannel and events endpoints.
///
/// Must be created inside a Tokio runtime; all of its tasks run there.
/// Dropping the client tears down the downchannel and stops the dispatcher.
pub struct ProtocolClient {
    inner: Arc<Inner>,
}

impl ProtocolClient {
    pub fn new<H: ClientHandler>(
        config: AvsConfig,
        tokens: Arc<dyn TokenSource>,
        handler: H,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| AvsError::NoRuntime)?;
        config.validate()?;

        let http = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(1)
            .build()?;

        let (dispatch, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            runtime: runtime.clone(),
            http,
            tokens,
            dispatch,
            upload_gate: tokio::sync::Mutex::new(()),
            downchannel: Mutex::new(None),
            next_stream_id: AtomicU64::new(1),
        });

        let dispatcher = Dispatcher::new(handler, Arc::clone(&inner));
        runtime.spawn(dispatcher.run(rx));
        log::info!("🚀 AVS client created for {}", inner.config.endpoint);

        Ok(Self { inner })
    }

    /// One-shot health check, reported through `on_ping`
    pub fn ping(&self) -> Result<()> {
        let bearer = self.inner.tokens.bearer_token()?;
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let result = keepalive::ping(&inner.http, &inner.config.ping_url(), &bearer).await;
            match &result {
                Ok(()) => log::info!("🏓 Ping success"),
                Err(e) => log::warn!("🏓 Ping failure: {}", e),
            }
            inner.deliver(Dispatch::Ping(result));
        });
        Ok(())
    }

    /// Open the downchannel. Once it is up, device state is synchronized
    /// (`on_sync`) and the keepalive starts pinging (`on_ping`).
    pub fn start_downchannel(&self) -> Result<()> {
        let bearer = self.inner.tokens.bearer_token()?;

        let mut slot = self
            .inner
            .downchannel
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // The stream cancels its own token once it has closed
        if slot.as_ref().is_some_and(|current| !current.cancel.is_cancelled()) {
            return Err(AvsError::DownchannelAlreadyOpen);
        }

        let stream = DownchannelStream::new(self.inner.http.clone(), &self.inner.config, bearer);
        let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        *slot = Some(DownchannelSlot {
            cancel: cancel.clone(),
            state: stream.state(),
        });
        drop(slot);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let scope = cancel.clone();
            let events = Arc::clone(&inner);
            stream
                .run(cancel.clone(), move |event| {
                    let opened = matches!(event, DownchannelEvent::Open);
                    events.deliver(Dispatch::Downchannel {
                        stream_id,
                        scope: scope.clone(),
                        event,
                    });
                    if opened {
                        events.on_downchannel_open(&scope);
                    }
                })
                .await;

            // Keepalive and alert timers hang off this token
            cancel.cancel();
            log::debug!("📡 Downchannel {} finished", stream_id);
        });

        Ok(())
    }

    /// Tear down the downchannel together with its keepalive and alert timers.
    /// Returns false when no downchannel was connecting or open.
    pub fn stop_downchannel(&self) -> bool {
        let slot = self
            .inner
            .downchannel
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(current) if !current.cancel.is_cancelled() => {
                log::info!("📡 Stopping downchannel");
                current.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn downchannel_state(&self) -> ConnectionState {
        self.inner
            .downchannel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|slot| match *slot.state.borrow() {
                // Spawned but not yet polled
                ConnectionState::Idle if !slot.cancel.is_cancelled() => ConnectionState::Connecting,
                state => state,
            })
            .unwrap_or(ConnectionState::Idle)
    }

    /// Send recorded 16 kHz mono PCM to the recognizer. The decoded directives,
    /// or the reason there are none, go to `on_directives`.
    pub fn post_recording(&self, audio: Vec<u8>) -> Result<()> {
        let bearer = self.inner.tokens.bearer_token()?;
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let result = inner.recognize(&audio, &bearer).await;
            if let Err(e) = &result {
                log::error!("Send audio error: {}", e);
            }
            inner.deliver(Dispatch::Directives(result));
        });
        Ok(())
    }

    /// Fire-and-forget event carrying only a token; the outcome goes to `on_event_sent`
    pub fn send_event(&self, namespace: &str, name: &str, token: &str) -> Result<()> {
        let bearer = self.inner.tokens.bearer_token()?;
        self.inner
            .spawn_send_event(EventEnvelope::with_token(namespace, name, token), bearer);
        Ok(())
    }

    /// Report that playback of the latest Speak directive started
    pub fn speech_started(&self) -> Result<()> {
        self.report_speech("SpeechStarted")
    }

    /// Report that playback of the latest Speak directive finished
    pub fn speech_finished(&self) -> Result<()> {
        self.report_speech("SpeechFinished")
    }

    fn report_speech(&self, name: &'static str) -> Result<()> {
        let bearer = self.inner.tokens.bearer_token()?;
        self.inner
            .dispatch
            .send(Dispatch::ReportSpeech { name, bearer })
            .map_err(|_| AvsError::ClientClosed)
    }

    /// Token of the most recent Speak directive, if any
    pub async fn speak_token(&self) -> Result<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .dispatch
            .send(Dispatch::SpeakToken(tx))
            .map_err(|_| AvsError::ClientClosed)?;
        rx.await.map_err(|_| AvsError::ClientClosed)
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.stop_downchannel();
        self.inner.deliver(Dispatch::Shutdown);
    }
}

struct AlertTimer {
    id: u64,
    cancel: CancellationToken,
}

/// Owns the handler and all mutable client state
struct Dispatcher<H> {
    handler: H,
    inner: Arc<Inner>,
    speak_token: Option<String>,
    current_stream: u64,
    /// Parent of alert timers; the live downchannel's token while one is up
    alert_scope: CancellationToken,
    alerts: HashMap<String, AlertTimer>,
    next_timer_id: u64,
}

impl<H: ClientHandler> Dispatcher<H> {
    fn new(handler: H, inner: Arc<Inner>) -> Self {
        Self {
            handler,
            inner,
            speak_token: None,
            current_stream: 0,
            alert_scope: CancellationToken::new(),
            alerts: HashMap::new(),
            next_timer_id: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
        while let Some(message) = rx.recv().await {
            match message {
                Dispatch::Shutdown => break,
                Dispatch::Ping(result) => self.handler.on_ping(result),
                Dispatch::Sync(result) => {
                    match &result {
                        Ok(()) => log::info!("🔄 Sync success"),
                        Err(e) => log::warn!("🔄 Sync failure: {}", e),
                    }
                    self.handler.on_sync(result);
                }
                Dispatch::Directives(result) => {
                    if let Ok(directives) = &result {
                        for directive in directives.iter().filter(|d| d.is_json()) {
                            self.inspect(directive);
                        }
                    }
                    self.handler.on_directives(result);
                }
                Dispatch::Downchannel {
                    stream_id,
                    scope,
                    event,
                } => self.on_downchannel(stream_id, scope, event),
                Dispatch::EventSent {
                    namespace,
                    name,
                    result,
                } => self.handler.on_event_sent(&namespace, &name, result),
                Dispatch::ReportSpeech { name, bearer } => match self.speak_token.clone() {
                    Some(token) => self.inner.spawn_send_event(
                        EventEnvelope::with_token("SpeechSynthesizer", name, &token),
                        bearer,
                    ),
                    None => self.handler.on_event_sent(
                        "SpeechSynthesizer",
                        name,
                        Err(AvsError::NoSpeakToken),
                    ),
                },
                Dispatch::AlertDue { token, timer_id } => {
                    let current = self.alerts.get(&token).map(|timer| timer.id);
                    if current == Some(timer_id) {
                        self.alerts.remove(&token);
                        self.handler.on_alert(&token);
                    }
                }
                Dispatch::SpeakToken(reply) => {
                    let _ = reply.send(self.speak_token.clone());
                }
            }
        }

        self.cancel_alerts();
        log::debug!("Dispatcher stopped");
    }

    fn on_downchannel(&mut self, stream_id: u64, scope: CancellationToken, event: DownchannelEvent) {
        if stream_id < self.current_stream {
            log::debug!("📡 Ignoring event from replaced downchannel {}", stream_id);
            return;
        }
        self.current_stream = stream_id;

        match event {
            DownchannelEvent::Connecting => {
                self.alert_scope = scope;
                self.set_state(ConnectionState::Connecting, None);
            }
            DownchannelEvent::Open => self.set_state(ConnectionState::Open, None),
            DownchannelEvent::Directive(json) => {
                log::info!("📨 Downchannel directive ({} bytes)", json.len());
                self.inspect(&Directive::json(json.clone().into_bytes()));
                self.handler.on_downchannel_directive(json);
            }
            DownchannelEvent::Closed(error) => {
                self.cancel_alerts();
                self.alert_scope = CancellationToken::new();
                self.set_state(ConnectionState::Closed, error);
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState, error: Option<AvsError>) {
        self.handler.on_downchannel_state(state, error);
    }

    /// Pick out the directives the client itself acts on
    fn inspect(&mut self, directive: &Directive) {
        let parsed = match directive.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Directive data has an error: {}", e);
                return;
            }
        };
        log::debug!(
            "Directive {}.{}",
            parsed.header.namespace,
            parsed.header.name
        );

        if let Some(token) = parsed.speak_token() {
            log::debug!("🗣️ Speak token updated");
            self.speak_token = Some(token.to_string());
        }
        if let Some((token, due)) = parsed.alert_schedule() {
            self.schedule_alert(token, due);
        }
        if let Some(token) = parsed.deleted_alert() {
            if let Some(timer) = self.alerts.remove(token) {
                log::info!("⏰ Alert {} deleted", token);
                timer.cancel.cancel();
            }
        }
        if parsed.is("SpeechRecognizer", "StopCapture") {
            log::info!("🛑 StopCapture received");
        }
    }

    fn schedule_alert(&mut self, token: String, due: chrono::DateTime<Utc>) {
        let delay = (due - Utc::now()).to_std().unwrap_or_default();
        log::info!(
            "⏰ SetAlert scheduledTime: {}; {} seconds from now",
            due,
            delay.as_secs()
        );

        self.next_timer_id += 1;
        let timer = AlertTimer {
            id: self.next_timer_id,
            cancel: self.alert_scope.child_token(),
        };
        let cancel = timer.cancel.clone();
        let timer_id = timer.id;
        if let Some(previous) = self.alerts.insert(token.clone(), timer) {
            previous.cancel.cancel();
        }

        let dispatch = self.inner.dispatch.clone();
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = dispatch.send(Dispatch::AlertDue { token, timer_id });
                }
            }
        });
    }

    fn cancel_alerts(&mut self) {
        for (_, timer) in self.alerts.drain() {
            timer.cancel.cancel();
        }
    }
}
