//! Conversation model: contacts, rooms and their ordered message logs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    /// Set for messages recovered from an archive or delivered with a delay stamp.
    pub delayed: bool,
}

/// Message log ordered by timestamp.
///
/// Messages with equal timestamps keep arrival order. A message whose id is
/// already present is ignored, which is how archive replays and live
/// delivery of the same message collapse into one entry.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Mutex<Vec<Message>>,
}

impl MessageLog {
    /// Insert `message`, returning `false` when its id was already logged.
    pub fn insert(&self, message: Message) -> bool {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        if messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let position = messages.partition_point(|m| m.timestamp <= message.timestamp);
        messages.insert(position, message);
        true
    }

    pub fn oldest(&self) -> Option<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A one-to-one conversation partner, keyed by bare JID.
#[derive(Debug)]
pub struct Contact {
    jid: String,
    log: MessageLog,
}

impl Contact {
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            log: MessageLog::default(),
        }
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }

    pub fn add_message(&self, message: Message) -> bool {
        self.log.insert(message)
    }

    pub fn oldest_message(&self) -> Option<Message> {
        self.log.oldest()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.log.snapshot()
    }
}

/// A multi-user chat room, keyed by bare JID.
#[derive(Debug)]
pub struct Room {
    jid: String,
    log: MessageLog,
}

impl Room {
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            log: MessageLog::default(),
        }
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }

    pub fn add_message(&self, message: Message) -> bool {
        self.log.insert(message)
    }

    pub fn oldest_message(&self) -> Option<Message> {
        self.log.oldest()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.log.snapshot()
    }
}

/// Either side of a conversation that history can be loaded for.
#[derive(Debug, Clone)]
pub enum Recipient {
    Contact(Arc<Contact>),
    Room(Arc<Room>),
}

impl Recipient {
    pub fn jid(&self) -> &str {
        match self {
            Recipient::Contact(contact) => contact.jid(),
            Recipient::Room(room) => room.jid(),
        }
    }

    pub fn oldest_message(&self) -> Option<Message> {
        match self {
            Recipient::Contact(contact) => contact.oldest_message(),
            Recipient::Room(room) => room.oldest_message(),
        }
    }
}

/// Lookup of contacts by bare JID.
pub trait ContactStore: Send + Sync {
    fn get_or_create_contact_by_id(&self, jid: &str) -> Arc<Contact>;
}

#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    contacts: Mutex<HashMap<String, Arc<Contact>>>,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, jid: &str) -> Option<Arc<Contact>> {
        self.contacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(jid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.contacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContactStore for InMemoryContactStore {
    fn get_or_create_contact_by_id(&self, jid: &str) -> Arc<Contact> {
        let mut contacts = self.contacts.lock().unwrap_or_else(PoisonError::into_inner);
        contacts
            .entry(jid.to_string())
            .or_insert_with(|| Arc::new(Contact::new(jid)))
            .clone()
    }
}
