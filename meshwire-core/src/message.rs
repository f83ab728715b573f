//! The immutable message envelope carried by the transport.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{CodecError, MessageCodec};
use crate::qualifier;

/// Unit of communication between nodes.
///
/// A message is a qualifier (routing/control discriminator), an optional
/// correlation id linking responses to their request, an ordered header map
/// and an opaque payload. Messages are immutable: use
/// [`Message::to_builder`] to derive a copy with some fields overridden.
///
/// # Examples
///
/// ```
/// use meshwire_core::Message;
///
/// let request = Message::with_qualifier("q/echo")
///     .correlation_id("1")
///     .header("trace", "abc")
///     .payload("hello")
///     .build();
///
/// // copy-with-override: same correlation id, headers and payload
/// let reply = request.to_builder().qualifier("q/reply").build();
/// assert_eq!(reply.correlation_id(), Some("1"));
/// assert_eq!(reply.header("trace"), Some("abc"));
/// assert_eq!(reply.payload().map(|p| p.as_ref()), Some(&b"hello"[..]));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    qualifier: String,
    correlation_id: Option<String>,
    headers: BTreeMap<String, String>,
    payload: Option<Bytes>,
}

impl Message {
    /// Start an empty builder.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Start a builder with the qualifier set.
    pub fn with_qualifier(qualifier: impl Into<String>) -> MessageBuilder {
        MessageBuilder::default().qualifier(qualifier)
    }

    /// Message carrying only a qualifier.
    pub fn from_qualifier(qualifier: impl Into<String>) -> Self {
        Self::with_qualifier(qualifier).build()
    }

    /// Message carrying only a payload.
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        Self::builder().payload(payload).build()
    }

    /// Builder pre-populated with every field of this message.
    pub fn to_builder(&self) -> MessageBuilder {
        MessageBuilder {
            inner: self.clone(),
        }
    }

    /// Routing/control discriminator.
    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    /// Correlation id, if set.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// All headers in key order.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Opaque payload bytes.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Whether this is the stream completion sentinel.
    pub fn is_completion(&self) -> bool {
        self.qualifier == qualifier::ON_COMPLETED
    }

    /// Whether this is the stream failure sentinel.
    pub fn is_failure(&self) -> bool {
        self.qualifier == qualifier::ON_ERROR
    }

    /// Whether this message terminates a response stream.
    pub fn is_terminal(&self) -> bool {
        self.is_completion() || self.is_failure()
    }

    /// Decode the payload with `codec`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingPayload`] when there is no payload, or the
    /// codec's decode error.
    pub fn decode_payload<T: DeserializeOwned, C: MessageCodec>(
        &self,
        codec: &C,
    ) -> Result<T, CodecError> {
        let payload = self.payload.as_ref().ok_or(CodecError::MissingPayload)?;
        codec.decode(payload)
    }
}

/// Builder for [`Message`].
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    inner: Message,
}

impl MessageBuilder {
    /// Set the qualifier.
    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.inner.qualifier = qualifier.into();
        self
    }

    /// Set the correlation id.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.inner.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set or clear the correlation id.
    pub fn maybe_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.inner.correlation_id = correlation_id;
        self
    }

    /// Insert a header, replacing any previous value.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.headers.insert(name.into(), value.into());
        self
    }

    /// Remove a header.
    pub fn remove_header(mut self, name: &str) -> Self {
        self.inner.headers.remove(name);
        self
    }

    /// Set the payload.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.inner.payload = Some(payload.into());
        self
    }

    /// Clear the payload.
    pub fn no_payload(mut self) -> Self {
        self.inner.payload = None;
        self
    }

    /// Encode `value` with `codec` and use it as the payload.
    ///
    /// # Errors
    ///
    /// Returns the codec's encode error.
    pub fn encode_payload<T: Serialize, C: MessageCodec>(
        self,
        codec: &C,
        value: &T,
    ) -> Result<Self, CodecError> {
        let bytes = codec.encode(value)?;
        Ok(self.payload(bytes))
    }

    /// Finish the message.
    pub fn build(self) -> Message {
        self.inner
    }
}
