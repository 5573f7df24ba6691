//! The `Traversable` capability.
//!
//! A value describes its shape and hands out mutable access to its children.
//! String leaves come out as [`Child::Text`]; everything else the sanitizer
//! descends into.

use crate::db::DynamicRow;
use crate::sanitize::record::SkipReason;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::{Arc, Mutex};

/// How a value is laid out, for tracing and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Numbers, booleans, dates, ids. Never modified.
    Scalar,
    /// A string leaf.
    Text,
    /// Ordered collection of elements.
    Sequence,
    /// Keyed collection; only values are visited.
    Map,
    /// Loosely-typed name/value record (dynamic rows, JSON objects).
    Dynamic,
    /// Structured record with declared members.
    Record,
    /// `Option`.
    Optional,
    /// Node behind a lock that may be reachable more than once.
    Shared,
}

/// One child of a traversed value.
pub enum Child<'a> {
    Text(&'a mut String),
    Node(&'a mut dyn Traversable),
    /// A record member excluded from traversal.
    Skipped {
        member: &'static str,
        reason: SkipReason,
    },
    /// A shared node, identified by its allocation address.
    Shared {
        addr: usize,
        node: &'a dyn SharedTraversable,
    },
}

impl std::fmt::Debug for Child<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Child::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Child::Node(n) => f.debug_tuple("Node").field(&n.shape()).finish(),
            Child::Skipped { member, reason } => f
                .debug_struct("Skipped")
                .field("member", member)
                .field("reason", reason)
                .finish(),
            Child::Shared { addr, .. } => f.debug_struct("Shared").field("addr", addr).finish(),
        }
    }
}

/// A value the sanitizer can walk.
pub trait Traversable: Send {
    fn shape(&self) -> Shape;

    /// Mutable access to every child, in a stable order.
    fn children(&mut self) -> Vec<Child<'_>>;
}

/// A shared node: the sanitizer locks it and walks the inner value.
pub trait SharedTraversable: Send + Sync {
    fn with_locked(&self, f: &mut dyn FnMut(&mut dyn Traversable));
}

impl<T: Traversable> SharedTraversable for Mutex<T> {
    fn with_locked(&self, f: &mut dyn FnMut(&mut dyn Traversable)) {
        // A poisoned node still holds data worth trimming.
        let mut guard = self.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut *guard);
    }
}

// =============================================================================
// Leaves
// =============================================================================

impl Traversable for String {
    fn shape(&self) -> Shape {
        Shape::Text
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        vec![Child::Text(self)]
    }
}

macro_rules! impl_scalar {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Traversable for $ty {
                fn shape(&self) -> Shape {
                    Shape::Scalar
                }

                fn children(&mut self) -> Vec<Child<'_>> {
                    Vec::new()
                }
            }
        )+
    };
}

impl_scalar!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    chrono::NaiveDate,
    chrono::NaiveTime,
    chrono::NaiveDateTime,
    chrono::DateTime<chrono::Utc>,
    chrono::DateTime<chrono::FixedOffset>,
    uuid::Uuid,
);

// =============================================================================
// Containers
// =============================================================================

impl<T: Traversable> Traversable for Option<T> {
    fn shape(&self) -> Shape {
        Shape::Optional
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        match self {
            Some(value) => vec![Child::Node(value)],
            None => Vec::new(),
        }
    }
}

impl<T: Traversable + ?Sized> Traversable for Box<T> {
    fn shape(&self) -> Shape {
        (**self).shape()
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        (**self).children()
    }
}

impl<T: Traversable> Traversable for Vec<T> {
    fn shape(&self) -> Shape {
        Shape::Sequence
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        self.iter_mut().map(|v| Child::Node(v)).collect()
    }
}

impl<T: Traversable> Traversable for VecDeque<T> {
    fn shape(&self) -> Shape {
        Shape::Sequence
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        self.iter_mut().map(|v| Child::Node(v)).collect()
    }
}

impl<T: Traversable> Traversable for [T] {
    fn shape(&self) -> Shape {
        Shape::Sequence
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        self.iter_mut().map(|v| Child::Node(v)).collect()
    }
}

impl<T: Traversable, const N: usize> Traversable for [T; N] {
    fn shape(&self) -> Shape {
        Shape::Sequence
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        self.iter_mut().map(|v| Child::Node(v)).collect()
    }
}

impl<K: Send, V: Traversable, S: BuildHasher + Send> Traversable for HashMap<K, V, S> {
    fn shape(&self) -> Shape {
        Shape::Map
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        self.values_mut().map(|v| Child::Node(v)).collect()
    }
}

impl<K: Send, V: Traversable> Traversable for BTreeMap<K, V> {
    fn shape(&self) -> Shape {
        Shape::Map
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        self.values_mut().map(|v| Child::Node(v)).collect()
    }
}

impl<T: Traversable> Traversable for Arc<Mutex<T>> {
    fn shape(&self) -> Shape {
        Shape::Shared
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        let addr = Arc::as_ptr(self) as *const () as usize;
        vec![Child::Shared {
            addr,
            node: &**self,
        }]
    }
}

// =============================================================================
// Dynamic records
// =============================================================================

impl Traversable for JsonValue {
    fn shape(&self) -> Shape {
        match self {
            JsonValue::String(_) => Shape::Text,
            JsonValue::Array(_) => Shape::Sequence,
            JsonValue::Object(_) => Shape::Dynamic,
            JsonValue::Null | JsonValue::Bool(_) | JsonValue::Number(_) => Shape::Scalar,
        }
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        match self {
            JsonValue::String(s) => vec![Child::Text(s)],
            JsonValue::Array(items) => items.iter_mut().map(|v| Child::Node(v)).collect(),
            JsonValue::Object(map) => map.values_mut().map(|v| Child::Node(v)).collect(),
            JsonValue::Null | JsonValue::Bool(_) | JsonValue::Number(_) => Vec::new(),
        }
    }
}

impl Traversable for serde_json::Map<String, JsonValue> {
    fn shape(&self) -> Shape {
        Shape::Dynamic
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        self.values_mut().map(|v| Child::Node(v)).collect()
    }
}

impl Traversable for DynamicRow {
    fn shape(&self) -> Shape {
        Shape::Dynamic
    }

    fn children(&mut self) -> Vec<Child<'_>> {
        self.values_mut().map(|v| Child::Node(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shapes() {
        assert_eq!(String::new().shape(), Shape::Text);
        assert_eq!(42i64.shape(), Shape::Scalar);
        assert_eq!(Some(1u8).shape(), Shape::Optional);
        assert_eq!(vec![1, 2].shape(), Shape::Sequence);
        assert_eq!(HashMap::<String, i32>::new().shape(), Shape::Map);
        assert_eq!(json!({"a": 1}).shape(), Shape::Dynamic);
        assert_eq!(json!(" x ").shape(), Shape::Text);
        assert_eq!(DynamicRow::new().shape(), Shape::Dynamic);
        assert_eq!(Arc::new(Mutex::new(1)).shape(), Shape::Shared);
    }

    #[test]
    fn test_scalar_has_no_children() {
        assert!(3.5f64.children().is_empty());
        assert!(uuid::Uuid::nil().children().is_empty());
        assert!(json!(null).children().is_empty());
    }

    #[test]
    fn test_none_has_no_children() {
        let mut value: Option<String> = None;
        assert!(value.children().is_empty());
    }

    #[test]
    fn test_shared_addr_is_stable() {
        let node = Arc::new(Mutex::new(String::from("x")));
        let mut a = Arc::clone(&node);
        let mut b = Arc::clone(&node);
        let addr_of = |children: Vec<Child<'_>>| match children.into_iter().next() {
            Some(Child::Shared { addr, .. }) => addr,
            other => panic!("unexpected child {:?}", other),
        };
        assert_eq!(addr_of(a.children()), addr_of(b.children()));
    }
}
