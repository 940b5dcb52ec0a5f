//! Data items exchanged between steps
//!
//! A data item is an immutable-once-emitted value identified by its [`Kind`]
//! and an opaque identity string. Steps see items as type-erased [`Item`]s
//! and downcast them back to the concrete [`Data`] type they expect.
//!
//! Cloning an [`Item`] deep-copies the payload, which is how every
//! destination mailbox ends up with an independent instance.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Type identity of a data item or representation
///
/// Kinds are used both for dependency matching during resolution and for
/// routing at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(Cow<'static, str>);

impl Kind {
    /// Create a kind from a static name
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Get the kind name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Kind {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl From<&'static str> for Kind {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}

/// A concrete data type that steps can emit and receive
///
/// # Example
///
/// ```
/// use clusterfacts_core::{Data, Kind};
/// use serde::Serialize;
///
/// #[derive(Debug, Clone, Serialize)]
/// struct QueueState {
///     queue: String,
///     pending: u32,
/// }
///
/// impl Data for QueueState {
///     const KIND: Kind = Kind::new("queue_state");
///
///     fn id(&self) -> String {
///         self.queue.clone()
///     }
/// }
/// ```
pub trait Data: Clone + fmt::Debug + Serialize + Send + Sync + 'static {
    /// Kind this type is routed under
    const KIND: Kind;

    /// Opaque identity of this value (used e.g. as a routing key)
    fn id(&self) -> String;
}

/// Object-safe view of a [`Data`] value
trait AnyValue: fmt::Debug + Send + Sync {
    fn clone_box(&self) -> Box<dyn AnyValue>;
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Data> AnyValue for T {
    fn clone_box(&self) -> Box<dyn AnyValue> {
        Box::new(self.clone())
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Output of a representation: a data item projected into a wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendered {
    /// MIME-like content type (e.g. `application/json`)
    pub mime: String,

    /// Rendered body
    pub body: String,
}

impl Data for Rendered {
    const KIND: Kind = Kind::new("rendered");

    fn id(&self) -> String {
        String::new()
    }
}

/// Type-erased data item as carried through mailboxes
pub struct Item {
    kind: Kind,
    id: String,
    value: Box<dyn AnyValue>,
}

impl Item {
    /// Wrap a typed value
    pub fn new<T: Data>(value: T) -> Self {
        Self {
            kind: T::KIND,
            id: value.id(),
            value: Box::new(value),
        }
    }

    /// Wrap a rendered representation under the representation's kind
    pub fn rendered(kind: Kind, id: impl Into<String>, rendered: Rendered) -> Self {
        Self {
            kind,
            id: id.into(),
            value: Box::new(rendered),
        }
    }

    /// Kind this item is routed under
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Identity of the item
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check whether the payload is a `T`
    pub fn is<T: Data>(&self) -> bool {
        self.value.as_any().is::<T>()
    }

    /// Borrow the payload as a `T`
    pub fn downcast_ref<T: Data>(&self) -> Option<&T> {
        self.value.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow the payload as a `T`
    pub fn downcast_mut<T: Data>(&mut self) -> Option<&mut T> {
        self.value.as_any_mut().downcast_mut::<T>()
    }

    /// Take the payload as a `T`, handing the item back on mismatch
    pub fn downcast<T: Data>(self) -> Result<T, Item> {
        if !self.is::<T>() {
            return Err(self);
        }
        match self.value.into_any().downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => unreachable!("payload type checked above"),
        }
    }

    /// Serialize the payload to JSON
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        self.value.to_json()
    }

    /// Content type and body suitable for publishing
    ///
    /// Rendered representations keep their own MIME type; any other item is
    /// published as JSON.
    pub fn wire_body(&self) -> Result<(String, String), serde_json::Error> {
        if let Some(rendered) = self.downcast_ref::<Rendered>() {
            return Ok((rendered.mime.clone(), rendered.body.clone()));
        }
        let body = serde_json::to_string(&self.to_json()?)?;
        Ok(("application/json".to_string(), body))
    }
}

impl Clone for Item {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            id: self.id.clone(),
            value: self.value.clone_box(),
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct NodeList {
        cluster: String,
        nodes: Vec<String>,
    }

    impl Data for NodeList {
        const KIND: Kind = Kind::new("node_list");

        fn id(&self) -> String {
            self.cluster.clone()
        }
    }

    fn sample() -> NodeList {
        NodeList {
            cluster: "alpha".to_string(),
            nodes: vec!["n1".to_string(), "n2".to_string()],
        }
    }

    #[test]
    fn test_item_carries_kind_and_id() {
        let item = Item::new(sample());
        assert_eq!(item.kind(), &Kind::new("node_list"));
        assert_eq!(item.id(), "alpha");
        assert!(item.is::<NodeList>());
        assert!(!item.is::<Rendered>());
    }

    #[test]
    fn test_clone_is_independent() {
        let original = Item::new(sample());
        let mut copy = original.clone();

        copy.downcast_mut::<NodeList>()
            .expect("payload is a NodeList")
            .nodes
            .push("n3".to_string());

        assert_eq!(original.downcast_ref::<NodeList>().unwrap().nodes.len(), 2);
        assert_eq!(copy.downcast_ref::<NodeList>().unwrap().nodes.len(), 3);
    }

    #[test]
    fn test_downcast_mismatch_returns_item() {
        let item = Item::new(sample());
        let back = item.downcast::<Rendered>().unwrap_err();
        assert_eq!(back.downcast::<NodeList>().unwrap(), sample());
    }

    #[test]
    fn test_wire_body() {
        let item = Item::new(sample());
        let (mime, body) = item.wire_body().unwrap();
        assert_eq!(mime, "application/json");
        assert!(body.contains("\"cluster\":\"alpha\""));

        let rendered = Item::rendered(
            Kind::new("node_list.text"),
            "alpha",
            Rendered {
                mime: "text/plain".to_string(),
                body: "n1\nn2".to_string(),
            },
        );
        assert_eq!(rendered.kind().as_str(), "node_list.text");
        let (mime, body) = rendered.wire_body().unwrap();
        assert_eq!(mime, "text/plain");
        assert_eq!(body, "n1\nn2");
    }

    #[test]
    fn test_kind_from_owned_string_matches_static() {
        assert_eq!(Kind::from("log".to_string()), Kind::new("log"));
    }
}
