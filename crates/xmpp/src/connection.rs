use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tern_core::event::{self, EventBus, EventPayload, EventSource};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use xmpp_parsers::jid::{BareJid, Jid};

use crate::{
    error::{ConnectionError, DispatchError, QueryError},
    plugin::{DispatchOutcome, PluginChain, PluginContext, StanzaPlugin},
    stanza::{Stanza, StanzaKind},
    transport::{LogInRequest, TransportEvent, XmppTransport},
};

const STANZA_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Online,
}

type PendingQueries = Mutex<HashMap<String, oneshot::Sender<Stanza>>>;

/// One client session: connection state, outbound traffic, and routing of
/// everything the transport delivers.
pub struct ConnectionEngine<T>
where
    T: XmppTransport,
{
    transport: T,
    state: watch::Sender<ConnectionState>,
    pending: PendingQueries,
    next_query_id: AtomicU64,
    local_jid: RwLock<Option<Jid>>,
    plugins: PluginChain,
    errors: broadcast::Sender<Stanza>,
    messages: broadcast::Sender<Stanza>,
    unclassified: broadcast::Sender<Stanza>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl<T> ConnectionEngine<T>
where
    T: XmppTransport,
{
    pub fn new(transport: T) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let seed = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        Self {
            transport,
            state,
            pending: Mutex::new(HashMap::new()),
            next_query_id: AtomicU64::new(seed),
            local_jid: RwLock::new(None),
            plugins: PluginChain::new(),
            errors: broadcast::channel(STANZA_CHANNEL_CAPACITY).0,
            messages: broadcast::channel(STANZA_CHANNEL_CAPACITY).0,
            unclassified: broadcast::channel(STANZA_CHANNEL_CAPACITY).0,
            event_bus: None,
        }
    }

    pub fn with_event_bus(transport: T, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            event_bus: Some(event_bus),
            ..Self::new(transport)
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn event_bus(&self) -> Option<&Arc<dyn EventBus>> {
        self.event_bus.as_ref()
    }

    /// Consume transport lifecycle events until the transport drops its sender.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event);
        }

        debug!("transport event channel closed");
        let was_online = self.set_state(ConnectionState::Disconnected);
        if was_online {
            self.emit_event(
                "system.connection.lost",
                EventPayload::ConnectionLost {
                    reason: "transport event channel closed".to_string(),
                },
            );
        }
    }

    pub(crate) fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Error(reason) => {
                error!(reason = %reason, "transport error");
                self.emit_event(
                    "system.error.occurred",
                    EventPayload::ErrorOccurred {
                        component: "transport".to_string(),
                        message: reason,
                        recoverable: true,
                    },
                );
            }
            TransportEvent::Status { status, detail } => {
                debug!(status = %status, detail = ?detail, "transport status");
            }
            TransportEvent::Online(full_jid) => self.on_online(&full_jid),
            TransportEvent::Stanza(stanza) => self.on_stanza_received(stanza),
        }
    }

    fn on_online(&self, full_jid: &str) {
        match full_jid.parse::<Jid>() {
            Ok(jid) => {
                *self.local_jid.write().unwrap_or_else(PoisonError::into_inner) = Some(jid);
            }
            Err(error) => {
                warn!(jid = full_jid, error = %error, "server assigned an unparsable JID");
            }
        }

        info!(jid = full_jid, "session online");
        self.set_state(ConnectionState::Online);
        self.emit_event(
            "system.connection.established",
            EventPayload::ConnectionEstablished {
                jid: full_jid.to_string(),
            },
        );
    }

    /// Route one inbound stanza.
    ///
    /// Errors go to the error channel, body messages to the message channel,
    /// and query responses to their waiting caller. Anything else is offered
    /// to the plugin chain and published as unclassified if nobody claims it.
    pub fn on_stanza_received(&self, stanza: Stanza) {
        if stanza.is_error() {
            debug!(kind = ?stanza.kind(), id = ?stanza.id(), "error stanza received");
            let _ = self.errors.send(stanza.clone());
            if stanza.kind() == StanzaKind::Iq {
                self.resolve_pending(stanza);
            }
            return;
        }

        if stanza.kind() == StanzaKind::Message && stanza.has_body_text() {
            let _ = self.messages.send(stanza);
            return;
        }

        if stanza.kind() == StanzaKind::Iq
            && matches!(stanza.type_(), Some("result" | "error"))
            && self.is_pending(stanza.id())
        {
            self.resolve_pending(stanza);
            return;
        }

        let ctx = self.plugin_context();
        match self.plugins.dispatch(&stanza, &ctx) {
            Ok(DispatchOutcome::Claimed { plugin }) => {
                debug!(plugin = %plugin, kind = ?stanza.kind(), "stanza claimed");
            }
            Ok(DispatchOutcome::Unclaimed) => {
                let _ = self.unclassified.send(stanza);
            }
            Err(error) => {
                error!(error = %error, "plugin failed to handle stanza");
                let source = match &error {
                    DispatchError::PluginFailed { plugin, .. } => {
                        EventSource::Plugin(plugin.clone())
                    }
                    _ => EventSource::Xmpp,
                };
                self.emit_event_from(
                    source,
                    "system.error.occurred",
                    EventPayload::ErrorOccurred {
                        component: "plugin".to_string(),
                        message: error.to_string(),
                        recoverable: true,
                    },
                );
            }
        }
    }

    pub async fn send(&self, stanza: &Stanza) -> Result<(), ConnectionError> {
        self.transport.send(stanza).await
    }

    /// Announce availability with an untyped `<presence/>`.
    pub async fn send_presence(&self) -> Result<(), ConnectionError> {
        self.send(&Stanza::presence(None)).await?;
        debug!("initial presence sent");
        Ok(())
    }

    /// Send a request and wait for the matching response.
    ///
    /// There is no built-in timeout; dropping the returned future abandons
    /// the query and frees its pending entry.
    pub async fn send_query(&self, mut stanza: Stanza) -> Result<Stanza, QueryError> {
        let id = self.next_query_id.fetch_add(1, Ordering::Relaxed).to_string();
        stanza.set_attr("id", id.clone());
        if let Some(jid) = self.local_jid() {
            stanza.set_attr("from", jid.to_string());
        }

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        self.transport.send(&stanza).await?;
        debug!(id = %id, "query sent");

        let response = rx.await.map_err(|_| ConnectionError::SessionClosed)?;
        if response.type_() == Some("error") {
            return Err(QueryError::Rejected(Box::new(response)));
        }
        Ok(response)
    }

    pub async fn log_in(&self, request: &LogInRequest) -> Result<(), ConnectionError> {
        info!(jid = %request.jid, uri = ?request.uri, "starting session");
        self.transport.start(request).await.inspect_err(|error| {
            let component = match error {
                ConnectionError::AuthenticationFailed(reason) => {
                    error!(jid = %request.jid, reason = %reason, "authentication rejected");
                    "authentication"
                }
                _ => {
                    error!(error = %error, "failed to start transport");
                    "transport"
                }
            };
            self.emit_event(
                "system.error.occurred",
                EventPayload::ErrorOccurred {
                    component: component.to_string(),
                    message: error.to_string(),
                    recoverable: false,
                },
            );
        })
    }

    /// Tear the session down. Failures while saying goodbye are only logged.
    pub async fn log_out(&self) {
        let was_online = self.set_state(ConnectionState::Disconnected);

        let abandoned = std::mem::take(&mut *self.lock_pending());
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "failing pending queries");
        }
        drop(abandoned);

        if let Err(error) = self.transport.send(&Stanza::presence(Some("unavailable"))).await {
            warn!(error = %error, "failed to send unavailable presence");
        }
        if let Err(error) = self.transport.stop().await {
            warn!(error = %error, "failed to stop transport");
        }

        *self.local_jid.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!("logged out");

        if was_online {
            self.emit_event(
                "system.connection.lost",
                EventPayload::ConnectionLost {
                    reason: "user requested logout".to_string(),
                },
            );
        }
    }

    pub fn register_plugin(&self, plugin: Arc<dyn StanzaPlugin>) {
        debug!(plugin = plugin.name(), priority = plugin.priority(), "plugin registered");
        self.plugins.register(plugin);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<Stanza> {
        self.errors.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Stanza> {
        self.messages.subscribe()
    }

    pub fn subscribe_unclassified(&self) -> broadcast::Receiver<Stanza> {
        self.unclassified.subscribe()
    }

    pub fn local_jid(&self) -> Option<Jid> {
        self.local_jid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn local_bare_jid(&self) -> Option<BareJid> {
        self.local_jid().map(|jid| jid.to_bare())
    }

    pub fn pending_query_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn plugin_context(&self) -> PluginContext {
        PluginContext {
            local_jid: self.local_jid(),
        }
    }

    /// Returns whether the previous state was `Online`.
    /// Subscribers are only woken when the state actually changes.
    fn set_state(&self, state: ConnectionState) -> bool {
        let mut previous = state;
        let changed = self.state.send_if_modified(|current| {
            previous = *current;
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!(from = ?previous, to = ?state, "connection state changed");
            self.plugins.notify_state(state);
        }
        previous == ConnectionState::Online
    }

    fn is_pending(&self, id: Option<&str>) -> bool {
        id.is_some_and(|id| self.lock_pending().contains_key(id))
    }

    fn resolve_pending(&self, stanza: Stanza) {
        let Some(id) = stanza.id().map(str::to_string) else {
            return;
        };
        let Some(waiter) = self.lock_pending().remove(&id) else {
            return;
        };
        if waiter.send(stanza).is_err() {
            warn!(id = %id, "dropping response for abandoned query");
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Stanza>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_event(&self, channel_name: &str, payload: EventPayload) {
        self.emit_event_from(EventSource::Xmpp, channel_name, payload);
    }

    fn emit_event_from(&self, source: EventSource, channel_name: &str, payload: EventPayload) {
        let Some(event_bus) = &self.event_bus else {
            return;
        };
        event::emit(event_bus.as_ref(), channel_name, source, payload);
    }
}

/// Removes a pending entry when its query future completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingQueries,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.id);
    }
}
