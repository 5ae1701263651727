//! Bus message types and the header contract shared by every service.
//!
//! # Header contract
//!
//! | Header        | Value                                   |
//! |---------------|-----------------------------------------|
//! | `event_id`    | external correlation id of the event    |
//! | `event_type`  | event type, equal to the topic          |
//! | `traceparent` | W3C trace context (optional)            |
//! | `tracestate`  | W3C trace state (optional)              |
//!
//! Producers that predate the contract send no headers. Consumers then fall
//! back to the message key as the event id and the topic as the event type
//! (see [`EventMeta::from_message`]).

use tokio::sync::oneshot;

/// Header carrying the event id.
pub const EVENT_ID_HEADER: &str = "event_id";

/// Header carrying the event type.
pub const EVENT_TYPE_HEADER: &str = "event_type";

/// Ordered message headers. Keys are unique; inserting an existing key
/// replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>,
}

impl Headers {
    /// Create an empty header set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert a header, replacing any existing value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Raw value of a header.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Value of a header as UTF-8. Empty or non-UTF-8 values count as absent.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .filter(|v| !v.is_empty())
    }

    /// Iterate over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A message ready to be sent to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination topic (the event type).
    pub topic: String,
    /// Partitioning key (the aggregate id), so one aggregate stays ordered.
    pub key: Vec<u8>,
    /// Event metadata headers.
    pub headers: Headers,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was read from.
    pub topic: String,
    /// Message key, if the producer set one.
    pub key: Option<Vec<u8>>,
    /// Message headers.
    pub headers: Headers,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Partition the message was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

impl InboundMessage {
    /// Build an inbound message without partition information.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            headers: Headers::new(),
            payload: payload.into(),
            partition: 0,
            offset: 0,
        }
    }

    /// Set the message key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// What a consumer of `message` would receive.
    #[must_use]
    pub fn from_outbound(message: &OutboundMessage, partition: i32, offset: i64) -> Self {
        Self {
            topic: message.topic.clone(),
            key: Some(message.key.clone()),
            headers: message.headers.clone(),
            payload: message.payload.clone(),
            partition,
            offset,
        }
    }
}

/// Canonical event metadata derived from an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    /// Event id used as the inbox key.
    pub event_id: String,
    /// Event type.
    pub event_type: String,
}

impl EventMeta {
    /// Derive metadata, preferring the explicit headers and falling back to
    /// the key (event id) and topic (event type).
    ///
    /// A message with neither an `event_id` header nor a key is identified by
    /// its position (`topic/partition/offset`), which is stable across
    /// redeliveries.
    #[must_use]
    pub fn from_message(message: &InboundMessage) -> Self {
        let event_id = message
            .headers
            .get_str(EVENT_ID_HEADER)
            .map(str::to_string)
            .or_else(|| {
                message
                    .key
                    .as_ref()
                    .filter(|k| !k.is_empty())
                    .map(|k| String::from_utf8_lossy(k).into_owned())
            })
            .unwrap_or_else(|| {
                format!("{}/{}/{}", message.topic, message.partition, message.offset)
            });

        let event_type = message
            .headers
            .get_str(EVENT_TYPE_HEADER)
            .map_or_else(|| message.topic.clone(), str::to_string);

        Self {
            event_id,
            event_type,
        }
    }
}

/// An inbound message together with its acknowledgement handle.
///
/// Calling [`Delivery::ack`] tells the bus the message is done and its offset
/// may be committed. Dropping the delivery without acknowledging it asks for
/// redelivery.
#[derive(Debug)]
pub struct Delivery {
    message: InboundMessage,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// Wrap a message with an acknowledgement channel.
    #[must_use]
    pub const fn new(message: InboundMessage, ack: oneshot::Sender<()>) -> Self {
        Self {
            message,
            ack: Some(ack),
        }
    }

    /// A delivery whose acknowledgement is ignored.
    #[must_use]
    pub const fn detached(message: InboundMessage) -> Self {
        Self { message, ack: None }
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Acknowledge the message.
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            // Receiver gone means the subscription already ended.
            let _ = ack.send(());
        }
    }
}
