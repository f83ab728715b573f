//! Qualifier → handler routing for the server processor.
//!
//! Lookup tries the exact qualifier first, then the longest registered prefix
//! ending on a `/` boundary, so a handler for `"quotes"` serves
//! `"quotes/ticks"` unless `"quotes/ticks"` has its own.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use meshwire_core::{qualifier, Qualifier};

use super::error::RegistrationError;
use super::handler::{HandlerSet, StreamHandler};

pub(crate) struct DispatchTable {
    handlers: RwLock<HashMap<String, Arc<dyn StreamHandler>>>,
}

impl DispatchTable {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn StreamHandler>>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn StreamHandler>>> {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register every handler of `set`, or none of them.
    pub(crate) fn insert_all(&self, set: HandlerSet) -> Result<Vec<String>, RegistrationError> {
        let handlers = set.into_handlers();
        let mut table = self.write();

        let mut seen = std::collections::HashSet::new();
        for (q, _) in &handlers {
            if qualifier::is_reserved(q) {
                return Err(RegistrationError::ReservedQualifier {
                    qualifier: q.clone(),
                });
            }
            if table.contains_key(q) || !seen.insert(q.as_str()) {
                return Err(RegistrationError::DuplicateQualifier {
                    qualifier: q.clone(),
                });
            }
        }

        let mut registered = Vec::with_capacity(handlers.len());
        for (q, handler) in handlers {
            registered.push(q.clone());
            table.insert(q, handler);
        }
        Ok(registered)
    }

    pub(crate) fn remove(&self, qualifier: &str) -> bool {
        self.write().remove(qualifier).is_some()
    }

    /// Handler for `qualifier`, by exact match or longest `/` prefix.
    pub(crate) fn lookup(&self, qualifier: &str) -> Option<Arc<dyn StreamHandler>> {
        let table = self.read();
        let handler = Qualifier::new(qualifier)
            .prefixes()
            .find_map(|prefix| table.get(prefix).cloned());
        handler
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::handler::ResponseStream;
    use futures::stream::{self, StreamExt};
    use meshwire_core::Message;

    fn tagged(tag: &'static str) -> impl Fn(Message) -> ResponseStream + Send + Sync + 'static {
        move |_request: Message| {
            stream::once(async move { Ok(Message::from_qualifier(tag)) }).boxed()
        }
    }

    async fn which(table: &DispatchTable, q: &str) -> Option<String> {
        let handler = table.lookup(q)?;
        let mut values = handler.handle(Message::from_qualifier(q));
        let first = values.next().await?.expect("value");
        Some(first.qualifier().to_string())
    }

    #[tokio::test]
    async fn test_exact_then_longest_prefix() {
        let table = DispatchTable::new();
        table
            .insert_all(
                HandlerSet::new()
                    .handler("quotes", tagged("root"))
                    .handler("quotes/ticks", tagged("ticks")),
            )
            .expect("register");

        assert_eq!(which(&table, "quotes/ticks").await.as_deref(), Some("ticks"));
        assert_eq!(which(&table, "quotes/ticks/live").await.as_deref(), Some("ticks"));
        assert_eq!(which(&table, "quotes/bars").await.as_deref(), Some("root"));
        assert_eq!(which(&table, "quotesx").await, None);
        assert_eq!(which(&table, "other/ticks").await, None);
    }

    #[test]
    fn test_registration_is_all_or_nothing() {
        let table = DispatchTable::new();
        table
            .insert_all(HandlerSet::new().handler("a/one", tagged("one")))
            .expect("register");

        let err = table
            .insert_all(
                HandlerSet::new()
                    .handler("a/two", tagged("two"))
                    .handler("a/one", tagged("again")),
            )
            .expect_err("duplicate");
        assert_eq!(
            err,
            RegistrationError::DuplicateQualifier {
                qualifier: "a/one".to_string()
            }
        );
        assert_eq!(table.len(), 1, "a/two must not be registered");

        let err = table
            .insert_all(HandlerSet::new().handler(qualifier::ON_COMPLETED, tagged("x")))
            .expect_err("reserved");
        assert!(matches!(err, RegistrationError::ReservedQualifier { .. }));
    }

    #[test]
    fn test_remove() {
        let table = DispatchTable::new();
        table
            .insert_all(HandlerSet::new().handler("a/one", tagged("one")))
            .expect("register");
        assert!(table.remove("a/one"));
        assert!(!table.remove("a/one"));
        assert!(table.lookup("a/one").is_none());
    }
}
