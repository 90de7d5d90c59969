use std::str::FromStr;

use xmpp_parsers::minidom::Element;

use crate::error::{DispatchError, StanzaError};

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    StreamError,
}

impl StanzaKind {
    pub fn name(self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
            StanzaKind::StreamError => "stream:error",
        }
    }
}

/// A single top-level protocol unit, classified by its root element.
///
/// Inbound stanzas are read-only. The engine stamps `id` and `from` on
/// outbound stanzas right before they are handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    element: Element,
}

impl Stanza {
    pub fn parse(raw: &[u8]) -> Result<Self, DispatchError> {
        let xml = std::str::from_utf8(raw).map_err(|error| {
            DispatchError::ParseFailed(format!("invalid UTF-8 stanza bytes: {error}"))
        })?;
        let trimmed = xml.trim();
        if trimmed.is_empty() {
            return Err(DispatchError::ParseFailed(
                "stanza payload is empty".to_string(),
            ));
        }

        let element = Element::from_str(trimmed).map_err(|error| {
            DispatchError::ParseFailed(format!("failed to parse stanza XML: {error}"))
        })?;
        Self::try_from(element)
    }

    /// Build an outbound `<iq/>` carrying a single payload element.
    pub fn iq(type_: &str, to: Option<&str>, payload: Element) -> Self {
        let mut builder = Element::builder("iq", NS_CLIENT).attr("type", type_);
        if let Some(to) = to {
            builder = builder.attr("to", to);
        }
        Self {
            kind: StanzaKind::Iq,
            element: builder.append(payload).build(),
        }
    }

    pub fn presence(type_: Option<&str>) -> Self {
        let mut builder = Element::builder("presence", NS_CLIENT);
        if let Some(type_) = type_ {
            builder = builder.attr("type", type_);
        }
        Self {
            kind: StanzaKind::Presence,
            element: builder.build(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DispatchError> {
        let mut payload = Vec::new();
        self.element.write_to(&mut payload).map_err(|error| {
            DispatchError::ParseFailed(format!(
                "failed to serialize <{}/> stanza: {error}",
                self.kind.name()
            ))
        })?;
        Ok(payload)
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.attr(name)
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn type_(&self) -> Option<&str> {
        self.attr("type")
    }

    pub fn from(&self) -> Option<&str> {
        self.attr("from")
    }

    pub fn to(&self) -> Option<&str> {
        self.attr("to")
    }

    pub fn is_error(&self) -> bool {
        self.kind == StanzaKind::StreamError || self.type_() == Some("error")
    }

    /// First direct child with the given local name, in any namespace.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.element.children().find(|child| child.name() == name)
    }

    pub fn child_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.element.get_child(name, ns)
    }

    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(Element::text)
    }

    /// Body text, if the stanza carries a `<body/>` child.
    pub fn body(&self) -> Option<String> {
        self.child_text("body")
    }

    /// True for any non-empty `<body/>`, whitespace included.
    pub fn has_body_text(&self) -> bool {
        self.body().is_some_and(|body| !body.is_empty())
    }

    pub fn require_child(&self, name: &str) -> Result<&Element, StanzaError> {
        self.child(name).ok_or_else(|| StanzaError::MissingChild {
            stanza: self.kind.name(),
            child: name.to_string(),
        })
    }

    pub fn require_attr(&self, name: &str) -> Result<&str, StanzaError> {
        self.attr(name).ok_or_else(|| StanzaError::MissingAttribute {
            stanza: self.kind.name(),
            attribute: name.to_string(),
        })
    }

    pub(crate) fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        self.element.set_attr(name, value.into());
    }
}

impl TryFrom<Element> for Stanza {
    type Error = DispatchError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        let kind = match element.name() {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            "error" if element.ns() == NS_STREAM => StanzaKind::StreamError,
            other => {
                return Err(DispatchError::ParseFailed(format!(
                    "unsupported stanza element <{other}/>"
                )));
            }
        };
        Ok(Self { kind, element })
    }
}

impl From<Stanza> for Element {
    fn from(value: Stanza) -> Self {
        value.element
    }
}
