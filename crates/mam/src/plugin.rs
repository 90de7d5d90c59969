use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tern_core::contact::{ContactStore, Direction, Message};
use tern_xmpp::jid::{BareJid, Jid};
use tern_xmpp::minidom::Element;
use tern_xmpp::{DispatchError, PluginContext, Stanza, StanzaKind, StanzaPlugin};
use tracing::debug;
use uuid::Uuid;

use crate::notify::HistoryNotifier;
use crate::query::{NS_DELAY, NS_FORWARD, NS_MAM, NS_SID};

/// Runs ahead of generic message handling so archive replays are never
/// treated as live traffic.
pub const ARCHIVE_RESULT_PRIORITY: i32 = 10;

/// Receives archived groupchat messages, which belong to the multi-user chat layer.
pub trait RoomMessageHandler: Send + Sync {
    fn handle_room_message_stanza(
        &self,
        message: &Element,
        delay: Option<&Element>,
    ) -> Result<(), DispatchError>;
}

/// Claims `<message><result xmlns='urn:xmpp:mam:2'/></message>` and merges
/// the forwarded message into the conversation it belongs to.
pub struct ArchiveResultPlugin {
    contacts: Arc<dyn ContactStore>,
    rooms: Arc<dyn RoomMessageHandler>,
    notifier: HistoryNotifier,
    delivered: Arc<AtomicU64>,
}

impl ArchiveResultPlugin {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        rooms: Arc<dyn RoomMessageHandler>,
        notifier: HistoryNotifier,
    ) -> Self {
        Self {
            contacts,
            rooms,
            notifier,
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Running count of archived messages merged into contacts or handed to rooms.
    pub fn delivered_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.delivered)
    }

    fn handle_chat(
        &self,
        message: &Element,
        delay: Option<&Element>,
        ctx: &PluginContext,
    ) -> Result<(), DispatchError> {
        let body = child_by_name(message, "body")
            .map(|body| body.text().trim().to_string())
            .unwrap_or_default();
        if body.is_empty() {
            return Ok(());
        }

        let local = ctx.local_bare_jid().ok_or_else(|| {
            DispatchError::Protocol("archive result received before session was bound".into())
        })?;
        let to = bare_attr(message, "to")?;
        let direction = if to == local {
            Direction::In
        } else {
            Direction::Out
        };
        let contact_jid = match direction {
            Direction::In => bare_attr(message, "from")?,
            Direction::Out => to,
        };

        let timestamp = delay_stamp(delay)?;
        let id = stable_message_id(message);

        let contact = self
            .contacts
            .get_or_create_contact_by_id(&contact_jid.to_string());
        let added = contact.add_message(Message {
            id: id.clone(),
            direction,
            timestamp,
            body,
            delayed: true,
        });
        debug!(contact = %contact_jid, id = %id, added, "archived chat message");

        if added {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            self.notifier.notify();
        }
        Ok(())
    }
}

impl StanzaPlugin for ArchiveResultPlugin {
    fn name(&self) -> &str {
        "mam"
    }

    fn priority(&self) -> i32 {
        ARCHIVE_RESULT_PRIORITY
    }

    fn handle_stanza(&self, stanza: &Stanza, ctx: &PluginContext) -> Result<bool, DispatchError> {
        if stanza.kind() != StanzaKind::Message {
            return Ok(false);
        }
        let Some(result) = stanza.child_ns("result", NS_MAM) else {
            return Ok(false);
        };

        let forwarded = result
            .get_child("forwarded", NS_FORWARD)
            .ok_or_else(|| DispatchError::Protocol("archive result without <forwarded/>".into()))?;
        let message = child_by_name(forwarded, "message").ok_or_else(|| {
            DispatchError::Protocol("archive result without forwarded <message/>".into())
        })?;
        let delay = forwarded.get_child("delay", NS_DELAY);

        match message.attr("type") {
            Some("chat") => self.handle_chat(message, delay, ctx)?,
            Some("groupchat") => {
                self.rooms.handle_room_message_stanza(message, delay)?;
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            other => {
                return Err(DispatchError::Protocol(format!(
                    "unknown archived message type: {}",
                    other.unwrap_or("none")
                )));
            }
        }
        Ok(true)
    }
}

/// The id a message keeps across live delivery and archive replay.
///
/// Prefers the message `id`, then `<origin-id/>`, then `<stanza-id/>`, and
/// falls back to a fresh UUID.
pub fn stable_message_id(message: &Element) -> String {
    if let Some(id) = message.attr("id").filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    ["origin-id", "stanza-id"]
        .into_iter()
        .find_map(|name| {
            message
                .get_child(name, NS_SID)
                .and_then(|child| child.attr("id"))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn child_by_name<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    element.children().find(|child| child.name() == name)
}

fn bare_attr(message: &Element, attr: &str) -> Result<BareJid, DispatchError> {
    let value = message.attr(attr).ok_or_else(|| {
        DispatchError::Protocol(format!("archived chat message without '{attr}'"))
    })?;
    value
        .parse::<Jid>()
        .map(|jid| jid.to_bare())
        .map_err(|error| DispatchError::Protocol(format!("invalid '{attr}' JID {value}: {error}")))
}

fn delay_stamp(delay: Option<&Element>) -> Result<DateTime<Utc>, DispatchError> {
    let stamp = delay
        .and_then(|delay| delay.attr("stamp"))
        .ok_or_else(|| DispatchError::Protocol("archive result without delay stamp".into()))?;
    DateTime::parse_from_rfc3339(stamp)
        .map(|stamp| stamp.with_timezone(&Utc))
        .map_err(|error| DispatchError::Protocol(format!("unparsable delay stamp {stamp}: {error}")))
}
