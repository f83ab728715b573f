//! Qualifiers: the routing and control discriminator of a [`Message`](crate::Message).
//!
//! User qualifiers are free-form strings, conventionally `namespace/action`
//! (`"greeting/hello"`). Everything under the [`RESERVED_NAMESPACE`] is owned by
//! the protocol itself and never reaches a user handler.

/// Namespace owned by the protocol.
pub const RESERVED_NAMESPACE: &str = "meshwire";

/// Terminates a response stream successfully. Carries no value.
pub const ON_COMPLETED: &str = "meshwire/onCompleted";

/// Terminates a response stream with a failure. The payload, if any,
/// describes the error.
pub const ON_ERROR: &str = "meshwire/onError";

/// First frame on a freshly opened connection, announcing the connector.
pub const HELLO: &str = "meshwire/hello";

/// Whether `qualifier` lives in the reserved namespace.
///
/// ```
/// use meshwire_core::qualifier;
///
/// assert!(qualifier::is_reserved(qualifier::ON_COMPLETED));
/// assert!(!qualifier::is_reserved("q/echo"));
/// assert!(!qualifier::is_reserved("meshwirex/echo"));
/// ```
pub fn is_reserved(qualifier: &str) -> bool {
    Qualifier::new(qualifier).namespace() == Some(RESERVED_NAMESPACE)
}

/// Borrowed `namespace/action` view of a qualifier string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qualifier<'a> {
    raw: &'a str,
}

impl<'a> Qualifier<'a> {
    /// Wrap a qualifier string.
    pub fn new(raw: &'a str) -> Self {
        Self { raw }
    }

    /// The full qualifier.
    pub fn as_str(&self) -> &'a str {
        self.raw
    }

    /// Part before the first `/`, if there is one.
    pub fn namespace(&self) -> Option<&'a str> {
        self.raw.split_once('/').map(|(ns, _)| ns)
    }

    /// Part after the first `/`, or the whole string without a namespace.
    pub fn action(&self) -> &'a str {
        self.raw
            .split_once('/')
            .map(|(_, action)| action)
            .unwrap_or(self.raw)
    }

    /// Prefixes of this qualifier ending on a `/` boundary, longest first.
    ///
    /// `"a/b/c"` yields `"a/b/c"`, `"a/b"`, `"a"`.
    pub fn prefixes(&self) -> impl Iterator<Item = &'a str> + 'a {
        let raw = self.raw;
        std::iter::once(raw).chain(
            raw.char_indices()
                .rev()
                .filter(|(_, c)| *c == '/')
                .map(move |(i, _)| &raw[..i]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_and_action() {
        let q = Qualifier::new("greeting/hello");
        assert_eq!(q.namespace(), Some("greeting"));
        assert_eq!(q.action(), "hello");

        let bare = Qualifier::new("ping");
        assert_eq!(bare.namespace(), None);
        assert_eq!(bare.action(), "ping");
    }

    #[test]
    fn test_prefixes_longest_first() {
        let prefixes: Vec<_> = Qualifier::new("a/b/c").prefixes().collect();
        assert_eq!(prefixes, vec!["a/b/c", "a/b", "a"]);

        let single: Vec<_> = Qualifier::new("echo").prefixes().collect();
        assert_eq!(single, vec!["echo"]);
    }

    #[test]
    fn test_reserved_sentinels() {
        for q in [ON_COMPLETED, ON_ERROR, HELLO] {
            assert!(is_reserved(q), "{q} should be reserved");
        }
        assert!(!is_reserved("meshwire"));
        assert!(!is_reserved(""));
    }
}
