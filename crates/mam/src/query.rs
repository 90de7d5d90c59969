//! Archive query construction and `<fin/>` interpretation.

use chrono::{DateTime, SecondsFormat, Utc};
use tern_xmpp::Stanza;
use tern_xmpp::minidom::Element;

use crate::MamError;

pub const NS_MAM: &str = "urn:xmpp:mam:2";
pub const NS_RSM: &str = "http://jabber.org/protocol/rsm";
pub const NS_DATA_FORMS: &str = "jabber:x:data";
pub const NS_FORWARD: &str = "urn:xmpp:forward:0";
pub const NS_DELAY: &str = "urn:xmpp:delay";
pub const NS_SID: &str = "urn:xmpp:sid:0";

/// Result Set Management paging directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    /// `<before/>`: the most recent page.
    Last,
    /// `<after>id</after>`: the page following the given cursor.
    After(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveQuery {
    pub to: Option<String>,
    pub with: Option<String>,
    pub end: Option<DateTime<Utc>>,
    pub max: Option<u32>,
    pub page: Option<PageRequest>,
}

impl ArchiveQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to(mut self, jid: impl Into<String>) -> Self {
        self.to = Some(jid.into());
        self
    }

    pub fn with(mut self, jid: impl Into<String>) -> Self {
        self.with = Some(jid.into());
        self
    }

    pub fn end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn max(mut self, max: u32) -> Self {
        self.max = Some(max);
        self
    }

    pub fn last_page(mut self) -> Self {
        self.page = Some(PageRequest::Last);
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.page = Some(PageRequest::After(cursor.into()));
        self
    }

    pub fn into_stanza(self) -> Stanza {
        let mut query = Element::builder("query", NS_MAM);

        if self.with.is_some() || self.end.is_some() {
            let mut form = Element::builder("x", NS_DATA_FORMS)
                .attr("type", "submit")
                .append(form_field("FORM_TYPE", Some("hidden"), NS_MAM));
            if let Some(with) = &self.with {
                form = form.append(form_field("with", None, with));
            }
            if let Some(end) = self.end {
                form = form.append(form_field("end", None, &format_timestamp(end)));
            }
            query = query.append(form.build());
        }

        if self.max.is_some() || self.page.is_some() {
            let mut set = Element::builder("set", NS_RSM);
            if let Some(max) = self.max {
                set = set.append(
                    Element::builder("max", NS_RSM)
                        .append(max.to_string())
                        .build(),
                );
            }
            set = match self.page {
                Some(PageRequest::Last) => set.append(Element::builder("before", NS_RSM).build()),
                Some(PageRequest::After(cursor)) => {
                    set.append(Element::builder("after", NS_RSM).append(cursor).build())
                }
                None => set,
            };
            query = query.append(set.build());
        }

        Stanza::iq("set", self.to.as_deref(), query.build())
    }
}

fn form_field(var: &str, type_: Option<&str>, value: &str) -> Element {
    let mut field = Element::builder("field", NS_DATA_FORMS).attr("var", var);
    if let Some(type_) = type_ {
        field = field.attr("type", type_);
    }
    field
        .append(
            Element::builder("value", NS_DATA_FORMS)
                .append(value.to_string())
                .build(),
        )
        .build()
}

/// RFC 3339 in UTC with a `Z` suffix, e.g. `2024-01-01T00:00:00Z`.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Completion state reported by the `<fin/>` element of an archive response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePage {
    pub complete: bool,
    pub last: Option<String>,
}

impl ArchivePage {
    pub fn from_response(response: &Stanza) -> Result<Self, MamError> {
        let fin = response
            .child_ns("fin", NS_MAM)
            .ok_or_else(|| MamError::Protocol("archive response without <fin/>".to_string()))?;

        let last = fin
            .get_child("set", NS_RSM)
            .and_then(|set| set.get_child("last", NS_RSM))
            .map(Element::text)
            .filter(|last| !last.is_empty());

        Ok(Self {
            complete: fin.attr("complete") == Some("true"),
            last,
        })
    }
}
