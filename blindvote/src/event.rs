use crate::*;
use chrono::{DateTime, Utc};
use num_enum::TryFromPrimitive;
use std::convert::TryFrom;

/// Tag carrying the election identifier an event is scoped to
pub const TAG_ELECTION: &str = "e";

/// Tag carrying the public key of the intended recipient
pub const TAG_RECIPIENT: &str = "p";

/// A raw tag: a name followed by one or more values
pub type Tag = Vec<String>;

/// An event kind, as carried in the integer `kind` field on the wire
#[derive(Serialize, Deserialize, TryFromPrimitive, Copy, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum EventKind {
    ElectionDefinition = 35000,
    Tally = 35001,
    SignatureRequest = 35010,
    SignatureResponse = 35011,
    Vote = 35012,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            EventKind::ElectionDefinition => "ElectionDefinition",
            EventKind::Tally => "Tally",
            EventKind::SignatureRequest => "SignatureRequest",
            EventKind::SignatureResponse => "SignatureResponse",
            EventKind::Vote => "Vote",
        };
        write!(f, "{}", name)
    }
}

/// An event as delivered by the relay
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: DateTime<Utc>,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub content: String,
}

// Canonical form hashed into the event id
#[derive(Serialize)]
struct CanonicalEvent<'a> {
    pubkey: &'a str,
    created_at: i64,
    kind: u16,
    tags: &'a [Tag],
    content: &'a str,
}

impl Event {
    /// Build an event from a draft, computing its identifier
    pub fn build(pubkey: &str, created_at: DateTime<Utc>, draft: EventDraft) -> Result<Self, Error> {
        let kind = draft.kind as u16;
        let canonical = CanonicalEvent {
            pubkey,
            created_at: created_at.timestamp(),
            kind,
            tags: &draft.tags,
            content: &draft.content,
        };
        let bytes = serde_cbor::to_vec(&canonical)
            .map_err(|e| Error::Transport(format!("cannot encode event: {}", e)))?;

        Ok(Event {
            id: hex::encode(sha256(&bytes)),
            pubkey: pubkey.to_owned(),
            created_at,
            kind,
            tags: draft.tags,
            content: draft.content,
        })
    }

    /// The decoded kind, if it is one we understand
    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::try_from_primitive(self.kind).ok()
    }

    /// First value of the first tag with the given name
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

/// An event that has not yet been published
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventKind,
    pub content: String,
    pub tags: Vec<Tag>,
}

impl EventDraft {
    pub fn new(kind: EventKind, content: String) -> Self {
        EventDraft {
            kind,
            content,
            tags: vec![],
        }
    }

    pub fn tag(mut self, name: &str, value: &str) -> Self {
        self.tags.push(vec![name.to_owned(), value.to_owned()]);
        self
    }
}

/// Subscription filter
///
/// An event matches if its kind is listed (or no kinds are listed), it carries
/// every required tag, and it is not older than `since`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub kinds: Vec<EventKind>,
    pub tags: Vec<(String, String)>,
    pub since: Option<DateTime<Utc>>,
}

impl Filter {
    pub fn kind(kind: EventKind) -> Self {
        Filter {
            kinds: vec![kind],
            ..Default::default()
        }
    }

    pub fn tag(mut self, name: &str, value: &str) -> Self {
        self.tags.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.iter().any(|k| *k as u16 == event.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        self.tags.iter().all(|(name, value)| {
            event.tags.iter().any(|tag| {
                tag.first() == Some(name) && tag.iter().skip(1).any(|v| v == value)
            })
        })
    }
}

/// A decoded event payload.
///
/// Integer kinds are resolved once here; everything downstream matches on the variant.
#[derive(Debug, Clone)]
pub enum Message {
    ElectionDefinition(Election),
    Tally(TallyEvent),
    SignatureRequest(SignatureRequest),
    SignatureResponse(SignatureResponse),
    Vote(CastableVote),
}

impl Message {
    pub fn decode(event: &Event) -> Result<Self, Error> {
        let kind = EventKind::try_from(event.kind)
            .map_err(|_| Error::Parse(format!("unknown event kind {}", event.kind)))?;

        let message = match kind {
            EventKind::ElectionDefinition => {
                Message::ElectionDefinition(Election::from_json(&event.content)?)
            }
            EventKind::Tally => {
                let election_id = event
                    .tag_value(TAG_ELECTION)
                    .ok_or_else(|| Error::Parse("tally event without election tag".to_owned()))?;
                Message::Tally(TallyEvent::parse(election_id, event.created_at, &event.content)?)
            }
            EventKind::SignatureRequest => {
                Message::SignatureRequest(serde_json::from_str(&event.content).map_err(parse_err)?)
            }
            EventKind::SignatureResponse => {
                Message::SignatureResponse(serde_json::from_str(&event.content).map_err(parse_err)?)
            }
            EventKind::Vote => Message::Vote(serde_json::from_str(&event.content).map_err(parse_err)?),
        };

        Ok(message)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Message::ElectionDefinition(_) => EventKind::ElectionDefinition,
            Message::Tally(_) => EventKind::Tally,
            Message::SignatureRequest(_) => EventKind::SignatureRequest,
            Message::SignatureResponse(_) => EventKind::SignatureResponse,
            Message::Vote(_) => EventKind::Vote,
        }
    }
}

fn parse_err(e: serde_json::Error) -> Error {
    Error::Parse(e.to_string())
}
