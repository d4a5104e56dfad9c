use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Host to runtime, answered by exactly one response (or error).
    Request,
    /// Runtime to host, carries the id of the request it answers.
    Response,
    /// Unsolicited notification, fanned out to every bound channel.
    Event,
}

impl MessageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
        }
    }
}

/// Event category. Subscriptions can be restricted to one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Topic(pub u16);

impl Topic {
    /// Topic of events that do not name one.
    pub const DEFAULT: Self = Self(0);
    /// Ends every subscription of the channel it reaches. The event itself is
    /// queued for `receive` rather than handed to subscribers.
    pub const KILL: Self = Self(u16::MAX);

    #[must_use]
    pub const fn is_kill(self) -> bool {
        self.0 == Self::KILL.0
    }
}

impl From<u16> for Topic {
    fn from(topic: u16) -> Self {
        Self(topic)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque payload plus its discriminant and correlation id.
///
/// Ids are assigned by the runtime when a message is sent; a freshly built
/// message has id `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u64,
    kind: MessageKind,
    topic: Topic,
    payload: Bytes,
}

impl Message {
    #[must_use]
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            id: 0,
            kind,
            topic: Topic::DEFAULT,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn request(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Request, payload)
    }

    #[must_use]
    pub fn event(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Event, payload)
    }

    pub(crate) fn response(id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind: MessageKind::Response,
            topic: Topic::DEFAULT,
            payload: payload.into(),
        }
    }

    pub(crate) const fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub const fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Always [`Topic::DEFAULT`] for requests and responses.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
