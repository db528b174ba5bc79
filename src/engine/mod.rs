//! The protocol engine: connection lifecycle, request/response and events.
//!
//! `connect` negotiates the stream on the caller's task (stream open,
//! STARTTLS, SASL, bind, session). Once the stream is ready it is split: a
//! reader task decodes stanzas into a queue and a dispatcher task resolves
//! pending requests or raises events from it. A fatal error tears the
//! connection down exactly once: both tasks stop, every pending request is
//! failed, and error listeners are notified.

mod dispatch;
pub mod events;
pub mod features;
mod negotiation;
pub mod state;


use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::correlation::{CorrelationTable, IqCallback};
use crate::error::{Result, TlsError, XmppError};
use crate::jid::Jid;
use crate::sasl::Credentials;
use crate::stanza::{Header, Iq, IqType, Message, Presence, Stanza};
use crate::transport::{BoxedIo, Connector, TcpConnector, Transport};
use crate::xml::Element;

pub use events::Listeners;
pub use features::StreamFeatures;
use negotiation::Negotiator;
pub use state::ConnectionState;

pub const NS_PING: &str = "urn:xmpp:ping";

/// Monotonic connection id for correlating logs across tasks.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handles of the live connection. Taken exactly once on teardown.
struct Connection {
    id: u64,
    shutdown_tx: broadcast::Sender<()>,
}

#[derive(Default)]
struct Status {
    state: ConnectionState,
    connected: bool,
    authenticated: bool,
    encrypted: bool,
    tls_required: bool,
    jid: Option<Jid>,
    resource: Option<String>,
    credentials: Option<(String, String)>,
    connection: Option<Connection>,
}

pub(crate) struct Inner {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    correlation: CorrelationTable,
    listeners: Listeners,
    status: Mutex<Status>,
    writer: tokio::sync::Mutex<Option<(u64, WriteHalf<BoxedIo>)>>,
    /// Serializes connect/authenticate/close.
    lifecycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Inner {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut st = self.status();
        if st.state != next {
            if !st.state.can_transition_to(next) {
                warn!(from = %st.state, to = %next, "Unexpected state transition");
            }
            debug!(from = %st.state, to = %next, "State change");
            st.state = next;
        }
    }

    /// Tear down connection `conn_id` after a fatal error. Only the first
    /// call for a given connection has any effect.
    async fn fail(&self, conn_id: u64, error: XmppError) {
        let connection = {
            let mut st = self.status();
            match &st.connection {
                Some(c) if c.id == conn_id => {}
                _ => return,
            }
            st.state = ConnectionState::Failed;
            st.connected = false;
            st.authenticated = false;
            st.connection.take()
        };
        error!(conn_id, error = %error, "Connection failed");

        if let Some(connection) = connection {
            let _ = connection.shutdown_tx.send(());
        }
        self.drop_writer(conn_id).await;
        self.correlation.release_all(&error.disconnect_reason());
        self.listeners.raise_error(&error);
    }

    async fn drop_writer(&self, conn_id: u64) {
        let mut writer = self.writer.lock().await;
        if matches!(writer.as_ref(), Some((id, _)) if *id == conn_id) {
            if let Some((_, mut w)) = writer.take() {
                let _ = w.shutdown().await;
            }
        }
    }

    async fn write(&self, xml: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some((conn_id, writer)) = guard.as_mut() else {
            return Err(XmppError::Disconnected("not connected".to_string()));
        };
        let conn_id = *conn_id;
        if self.config.debug_stanzas {
            debug!(target: "fluux_xmpp::wire", conn_id, "SEND {}", xml);
        }
        let written = async {
            writer.write_all(xml.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        drop(guard);

        if let Err(e) = written {
            let reason = e.to_string();
            self.fail(conn_id, XmppError::Io(e)).await;
            return Err(XmppError::Disconnected(reason));
        }
        Ok(())
    }

    fn current_connection_id(&self) -> Option<u64> {
        self.status().connection.as_ref().map(|c| c.id)
    }

    /// A request whose timeout means the server itself stopped answering:
    /// a ping addressed to our own server domain.
    fn is_liveness_ping(&self, iq: &Iq) -> bool {
        let Some(to) = iq.header.to.as_ref() else {
            return false;
        };
        if to.node().is_some() {
            return false;
        }
        let domain = self
            .status()
            .jid
            .as_ref()
            .map(|j| j.domain().to_string())
            .unwrap_or_else(|| self.config.hostname.clone());
        if !to.domain().eq_ignore_ascii_case(&domain) {
            return false;
        }
        iq.payload.as_ref().map_or(false, |p| {
            let is_ping = |e: &Element| e.local_name() == "ping" && e.namespace() == Some(NS_PING);
            is_ping(p) || p.children().any(is_ping)
        })
    }
}

/// XMPP client engine. Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct XmppEngine {
    inner: Arc<Inner>,
}

impl XmppEngine {
    /// Engine connecting over TCP as configured.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let connector = Arc::new(TcpConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    /// Engine using a custom connector for the byte stream.
    pub fn with_connector(config: EngineConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                correlation: CorrelationTable::new(),
                listeners: Listeners::default(),
                status: Mutex::new(Status::default()),
                writer: tokio::sync::Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(XmppError::Closed);
        }
        Ok(())
    }

    // --- status ---

    pub fn state(&self) -> ConnectionState {
        self.inner.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status().connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.status().authenticated
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.status().encrypted
    }

    /// Whether the server's last features marked STARTTLS as mandatory.
    pub fn tls_required(&self) -> bool {
        self.inner.status().tls_required
    }

    /// Address bound for this session.
    pub fn jid(&self) -> Option<Jid> {
        self.inner.status().jid.clone()
    }

    // --- listeners ---

    /// Fatal connection errors detected by the engine.
    pub fn on_error(&self, f: impl Fn(&XmppError) + Send + Sync + 'static) {
        self.inner.listeners.on_error(f);
    }

    /// `iq` stanzas that are not replies to our own pending requests.
    pub fn on_iq(&self, f: impl Fn(&Iq) + Send + Sync + 'static) {
        self.inner.listeners.on_iq(f);
    }

    pub fn on_message(&self, f: impl Fn(&Message) + Send + Sync + 'static) {
        self.inner.listeners.on_message(f);
    }

    pub fn on_presence(&self, f: impl Fn(&Presence) + Send + Sync + 'static) {
        self.inner.listeners.on_presence(f);
    }

    // --- lifecycle ---

    /// Set the credentials used by the next `connect`.
    pub fn set_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        self.inner.status().credentials = Some((username.into(), password.into()));
    }

    /// Connect and negotiate the stream.
    ///
    /// With credentials set this runs through authentication and resource
    /// binding to `Ready`; without, it stops after the stream is secured.
    /// Failures are returned and also reported to error listeners.
    pub async fn connect(&self, resource: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.connect_locked(resource).await
    }

    async fn connect_locked(&self, resource: Option<&str>) -> Result<()> {
        {
            let mut st = self.inner.status();
            if st.connected {
                return Err(XmppError::Misuse("already connected".to_string()));
            }
            st.resource = resource.map(str::to_string);
            st.jid = None;
            st.encrypted = false;
            st.tls_required = false;
        }

        let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        self.inner.set_state(ConnectionState::StreamNegotiating);
        info!(conn_id, hostname = %self.inner.config.hostname, port = self.inner.config.port, "Connecting");

        let io = match self
            .inner
            .connector
            .connect(&self.inner.config.hostname, self.inner.config.port)
            .await
        {
            Ok(io) => io,
            Err(e) => return Err(self.abort_connect(conn_id, None, XmppError::Io(e)).await),
        };
        let mut negotiator = Negotiator::new(
            conn_id,
            Transport::new(io),
            self.inner.config.negotiation_timeout(),
            self.inner.config.debug_stanzas,
        );

        match self.negotiate(conn_id, &mut negotiator, resource).await {
            Ok(()) => {}
            Err(e) => return Err(self.abort_connect(conn_id, Some(negotiator), e).await),
        }

        let (transport, tokenizer, leftover) = negotiator.into_parts();
        let (read_half, write_half) = match transport.into_split() {
            Ok(halves) => halves,
            Err(e) => return Err(self.abort_connect(conn_id, None, e).await),
        };
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<dispatch::Inbound>();
        let (shutdown_tx, _) = broadcast::channel(1);
        let reader_shutdown = shutdown_tx.subscribe();
        let dispatcher_shutdown = shutdown_tx.subscribe();
        let keepalive_shutdown = shutdown_tx.subscribe();

        *self.inner.writer.lock().await = Some((conn_id, write_half));
        {
            let mut st = self.inner.status();
            st.connected = true;
            st.connection = Some(Connection { id: conn_id, shutdown_tx });
        }

        tokio::spawn(dispatch::read_loop(
            self.inner.clone(),
            conn_id,
            read_half,
            tokenizer,
            leftover,
            queue_tx,
            reader_shutdown,
        ));
        tokio::spawn(dispatch::dispatch_loop(
            self.inner.clone(),
            conn_id,
            queue_rx,
            dispatcher_shutdown,
        ));
        if let Some(interval) = self.inner.config.keepalive_interval() {
            if self.is_authenticated() {
                tokio::spawn(keepalive_loop(self.clone(), interval, keepalive_shutdown));
            }
        }

        info!(
            conn_id,
            state = %self.state(),
            jid = ?self.jid(),
            connect_ms = started.elapsed().as_millis() as u64,
            "Connected"
        );
        Ok(())
    }

    async fn negotiate(&self, conn_id: u64, n: &mut Negotiator, resource: Option<&str>) -> Result<()> {
        let config = &self.inner.config;
        let mut features = n.open_stream(&config.hostname, &config.language).await?;

        if let Some(starttls) = features.starttls {
            self.inner.status().tls_required = starttls.required;
            if !config.starttls {
                if starttls.required {
                    return Err(TlsError::TlsRequired.into());
                }
                warn!(conn_id, "Server offers STARTTLS but it is disabled, continuing unencrypted");
            } else {
                self.inner.set_state(ConnectionState::TlsNegotiating);
                n.starttls(config.validation_host(), config.dangerous_insecure_tls).await?;
                self.inner.status().encrypted = n.is_encrypted();
                self.inner.set_state(ConnectionState::StreamNegotiating);
                features = n.open_stream(&config.hostname, &config.language).await?;
            }
        }

        let credentials = self.inner.status().credentials.clone();
        let Some((username, password)) = credentials else {
            info!(conn_id, "No credentials, stream negotiated without authentication");
            return Ok(());
        };

        self.inner.set_state(ConnectionState::Authenticating);
        let credentials = Credentials {
            username: username.clone(),
            password,
            host: config.hostname.clone(),
        };
        n.authenticate(&features, credentials).await?;
        n.restart();
        let features = n.open_stream(&config.hostname, &config.language).await?;

        let jid = if features.bind {
            let jid = n.bind(resource).await?;
            self.inner.set_state(ConnectionState::Bound);
            jid
        } else {
            // Without binding the server assigns nothing; use the bare account address.
            Jid::new(Some(username.as_str()), &config.hostname, resource)?
        };
        if features.session_required {
            n.establish_session().await?;
        }

        {
            let mut st = self.inner.status();
            st.jid = Some(jid);
            st.authenticated = true;
        }
        self.inner.set_state(ConnectionState::Ready);
        Ok(())
    }

    async fn abort_connect(&self, conn_id: u64, negotiator: Option<Negotiator>, error: XmppError) -> XmppError {
        if let Some(mut n) = negotiator {
            n.close().await;
        }
        {
            let mut st = self.inner.status();
            st.connected = false;
            st.authenticated = false;
        }
        self.inner.set_state(ConnectionState::Failed);
        error!(conn_id, error = %error, "Connection setup failed");
        self.inner.listeners.raise_error(&error);
        error
    }

    /// Authenticate with new credentials.
    ///
    /// SASL cannot be restarted on a live stream, so this closes the current
    /// connection and connects again with the new credentials.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        self.ensure_open()?;
        if username.is_empty() {
            return Err(XmppError::Misuse("username must not be empty".to_string()));
        }
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_authenticated() {
            return Err(XmppError::Misuse("authentication has already been performed".to_string()));
        }
        self.set_credentials(username, password);
        self.disconnect().await;
        let resource = self.inner.status().resource.clone();
        self.connect_locked(resource.as_deref()).await
    }

    /// Close the stream gracefully and release everything pending.
    async fn disconnect(&self) {
        let connection = {
            let mut st = self.inner.status();
            st.connected = false;
            st.authenticated = false;
            st.connection.take()
        };
        if let Some(connection) = connection {
            let _ = self.inner.write("</stream:stream>").await;
            let _ = connection.shutdown_tx.send(());
            self.inner.drop_writer(connection.id).await;
            info!(conn_id = connection.id, "Disconnected");
        }
        self.inner.correlation.release_all("connection closed");
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Close the connection. The engine cannot be used afterwards.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.disconnect().await;
    }

    // --- sending ---

    fn ensure_connected(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.is_connected() {
            return Err(XmppError::Misuse("not connected".to_string()));
        }
        Ok(())
    }

    /// Send a stanza as is.
    pub async fn send(&self, stanza: impl Into<Stanza>) -> Result<()> {
        self.ensure_connected()?;
        self.inner.write(&stanza.into().to_xml()).await
    }

    /// Send raw XML verbatim.
    pub async fn send_raw(&self, xml: &str) -> Result<()> {
        self.ensure_connected()?;
        self.inner.write(xml).await
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.send(message).await
    }

    pub async fn send_presence(&self, presence: Presence) -> Result<()> {
        self.send(presence).await
    }

    fn build_request(
        &self,
        iq_type: IqType,
        to: Option<Jid>,
        from: Option<Jid>,
        payload: Option<Element>,
        language: Option<String>,
    ) -> Result<Iq> {
        if !iq_type.is_request() {
            return Err(XmppError::Misuse(format!(
                "requests must be get or set, not {}",
                iq_type
            )));
        }
        Ok(Iq {
            iq_type,
            header: Header {
                to,
                from,
                id: Some(self.inner.correlation.next_id()),
                language,
            },
            payload,
            error: None,
        })
    }

    /// Send a `get`/`set` request and wait for its reply.
    ///
    /// `timeout` of `None` uses the configured default, which may be
    /// unlimited. A timeout is returned as [`XmppError::Timeout`] and does not
    /// affect the connection, except for a ping to our own server, whose
    /// timeout means the connection is dead.
    pub async fn iq_request(
        &self,
        iq_type: IqType,
        to: Option<Jid>,
        from: Option<Jid>,
        payload: Option<Element>,
        language: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Iq> {
        self.ensure_connected()?;
        let iq = self.build_request(iq_type, to, from, payload, language)?;
        let id = iq.id().unwrap_or_default().to_string();
        let conn_id = self.inner.current_connection_id();

        let rx = self.inner.correlation.register_waiter(&id)?;
        let xml = Stanza::Iq(iq.clone()).to_xml();
        if let Err(e) = self.inner.write(&xml).await {
            self.inner.correlation.cancel(&id);
            return Err(e);
        }

        let reply = match timeout.or_else(|| self.inner.config.default_request_timeout()) {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.inner.correlation.cancel(&id);
                    warn!(id = %id, timeout_ms = limit.as_millis() as u64, "Request timed out");
                    if self.inner.is_liveness_ping(&iq) {
                        if let Some(conn_id) = conn_id {
                            self.inner
                                .fail(
                                    conn_id,
                                    XmppError::Disconnected("server did not answer ping".to_string()),
                                )
                                .await;
                        }
                    }
                    return Err(XmppError::Timeout);
                }
            },
            None => rx.await,
        };
        reply.map_err(|_| XmppError::Disconnected("request abandoned".to_string()))?
    }

    /// Send a `get`/`set` request and return its id immediately. `callback`
    /// runs off the dispatcher with the reply, or with the reason the
    /// connection went away first.
    pub async fn iq_request_async(
        &self,
        iq_type: IqType,
        to: Option<Jid>,
        from: Option<Jid>,
        payload: Option<Element>,
        language: Option<String>,
        callback: impl FnOnce(String, Result<Iq>) + Send + 'static,
    ) -> Result<String> {
        self.ensure_connected()?;
        let iq = self.build_request(iq_type, to, from, payload, language)?;
        let id = iq.id().unwrap_or_default().to_string();

        let callback: IqCallback = Box::new(callback);
        self.inner.correlation.register_callback(&id, callback)?;
        if let Err(e) = self.inner.write(&Stanza::Iq(iq).to_xml()).await {
            self.inner.correlation.cancel(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Answer a request received from the server.
    pub async fn iq_response(
        &self,
        iq_type: IqType,
        id: &str,
        to: Option<Jid>,
        from: Option<Jid>,
        payload: Option<Element>,
        language: Option<String>,
    ) -> Result<()> {
        if iq_type.is_request() {
            return Err(XmppError::Misuse(format!(
                "responses must be result or error, not {}",
                iq_type
            )));
        }
        if id.is_empty() {
            return Err(XmppError::Misuse("responses need the request id".to_string()));
        }
        let (payload, error) = match iq_type {
            IqType::Error => (None, payload),
            _ => (payload, None),
        };
        self.send(Iq {
            iq_type,
            header: Header {
                to,
                from,
                id: Some(id.to_string()),
                language,
            },
            payload,
            error,
        })
        .await
    }

    /// XEP-0199 ping to our server. Returns the round trip time.
    pub async fn ping(&self) -> Result<Duration> {
        self.ping_with_timeout(None).await
    }

    async fn ping_with_timeout(&self, timeout: Option<Duration>) -> Result<Duration> {
        let domain = self
            .jid()
            .map(|j| j.domain().to_string())
            .unwrap_or_else(|| self.inner.config.hostname.clone());
        let to = Jid::domain_only(&domain)?;
        let started = Instant::now();
        self.iq_request(
            IqType::Get,
            Some(to),
            None,
            Some(Element::new("ping").with_ns(NS_PING)),
            None,
            timeout,
        )
        .await?;
        Ok(started.elapsed())
    }
}

async fn keepalive_loop(engine: XmppEngine, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let timeout = engine.inner.config.default_request_timeout().unwrap_or(interval);
                match engine.ping_with_timeout(Some(timeout)).await {
                    Ok(rtt) => debug!(rtt_ms = rtt.as_millis() as u64, "Keepalive ping answered"),
                    Err(e) if !e.is_fatal() => warn!(error = %e, "Keepalive ping failed"),
                    Err(e) => {
                        debug!(error = %e, "Keepalive stopped");
                        break;
                    }
                }
            }
        }
    }
}
