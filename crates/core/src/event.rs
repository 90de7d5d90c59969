use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, crate::error::EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::error::EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("system" | "xmpp" | "ui" | "plugin")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "xmpp.mam.history.changed")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Optional correlation ID linking related events (e.g., sync started/completed)
    pub correlation_id: Option<Uuid>,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    /// Create a new event with a correlation ID.
    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(channel, source, payload)
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core system component
    System(String),
    /// XMPP subsystem
    Xmpp,
    /// Plugin with its name
    Plugin(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Session lifecycle ──────────────────────────────────────────
    ConnectionEstablished {
        jid: String,
    },
    ConnectionLost {
        reason: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Archive sync ───────────────────────────────────────────────
    SyncStarted,
    SyncCompleted {
        messages_synced: u64,
    },
    HistoryChanged,
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError>;
    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError>;
}

/// Publish a payload on a named channel, dropping it if the channel name is invalid.
///
/// Publishing is best-effort: a bus with no subscribers is not an error for emitters.
pub fn emit(bus: &dyn EventBus, channel_name: &str, source: EventSource, payload: EventPayload) {
    emit_event(bus, channel_name, source, payload, None);
}

/// Same as [`emit`], attaching a correlation id.
pub fn emit_correlated(
    bus: &dyn EventBus,
    channel_name: &str,
    source: EventSource,
    payload: EventPayload,
    correlation_id: Uuid,
) {
    emit_event(bus, channel_name, source, payload, Some(correlation_id));
}

fn emit_event(
    bus: &dyn EventBus,
    channel_name: &str,
    source: EventSource,
    payload: EventPayload,
    correlation_id: Option<Uuid>,
) {
    let Ok(channel) = Channel::new(channel_name) else {
        tracing::warn!(channel = channel_name, "dropping event for invalid channel");
        return;
    };

    let event = match correlation_id {
        Some(id) => Event::with_correlation(channel, source, payload, id),
        None => Event::new(channel, source, payload),
    };
    let _ = bus.publish(event);
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    xmpp_sender: broadcast::Sender<Event>,
    ui_sender: broadcast::Sender<Event>,
    plugin_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (xmpp_sender, _) = broadcast::channel(capacity);
        let (ui_sender, _) = broadcast::channel(capacity);
        let (plugin_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            xmpp_sender,
            ui_sender,
            plugin_sender,
        }
    }

    /// Build a bus sized by the `[event_bus]` config section.
    pub fn from_config(config: &crate::config::EventBusConfig) -> Self {
        Self::new(config.channel_capacity)
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "xmpp" => Some(&self.xmpp_sender),
            "ui" => Some(&self.ui_sender),
            "plugin" => Some(&self.plugin_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, crate::error::EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            ));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                xmpp: Some(self.xmpp_sender.subscribe()),
                ui: Some(self.ui_sender.subscribe()),
                plugin: Some(self.plugin_sender.subscribe()),
            });
        }

        let sender = self.sender_for_domain(first_segment).ok_or_else(|| {
            crate::error::EventBusError::InvalidPattern(pattern.to_string())
        })?;

        let mut receivers = DomainReceivers::default();
        let slot = match first_segment {
            "system" => &mut receivers.system,
            "xmpp" => &mut receivers.xmpp,
            "ui" => &mut receivers.ui,
            _ => &mut receivers.plugin,
        };
        *slot = Some(sender.subscribe());
        Ok(receivers)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| {
                crate::error::EventBusError::InvalidChannel(event.channel.to_string())
            })?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| crate::error::EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    xmpp: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
    plugin: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, crate::error::EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let xmpp_receiver = self.receivers.xmpp.as_mut();
            let ui_receiver = self.receivers.ui.as_mut();
            let plugin_receiver = self.receivers.plugin.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(xmpp_receiver) => result,
                result = recv_from_domain(ui_receiver) => result,
                result = recv_from_domain(plugin_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(crate::error::EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(crate::error::EventBusError::Lagged(count));
                }
            }
        }
    }

    /// Non-blocking receive: the next matching event already queued, if any.
    pub fn try_recv(&mut self) -> Option<Event> {
        let receivers = [
            self.receivers.system.as_mut(),
            self.receivers.xmpp.as_mut(),
            self.receivers.ui.as_mut(),
            self.receivers.plugin.as_mut(),
        ];

        for receiver in receivers.into_iter().flatten() {
            while let Ok(event) = receiver.try_recv() {
                if self.matcher.is_match(event.channel.as_str()) {
                    return Some(event);
                }
            }
        }
        None
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}
