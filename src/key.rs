//! Task addressing.
//!
//! A [`TaskSpace`] names tasks with multi-part keys chosen by the application,
//! like `solve[3, 1]`. A key expression may contain multi-valued components
//! (ranges, vectors) and denotes every key of the Cartesian product, so
//! `space.resolve((3, 0..j))` addresses `[3, 0], [3, 1], ..., [3, j - 1]`.
//!
//! Handles are created lazily on first reference, which lets a task depend on
//! a key before the task producing it has been spawned.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::ops::{Range, RangeInclusive};
use std::sync::{Arc, Mutex, PoisonError};

use crate::engine::TaskHandle;
use crate::error::KeyError;

/// A single component of a concrete task key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Int(i64),
    /// Unsigned values above `i64::MAX`.
    UInt(u64),
    Str(Arc<str>),
}

impl Display for KeyPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPart::Int(n) => write!(f, "{n}"),
            KeyPart::UInt(n) => write!(f, "{n}"),
            KeyPart::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.into())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value.into())
    }
}

impl From<Arc<str>> for KeyPart {
    fn from(value: Arc<str>) -> Self {
        KeyPart::Str(value)
    }
}

/// A concrete key, an ordered tuple of parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(Vec<KeyPart>);

impl TaskKey {
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self(parts.into_iter().collect())
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str("]")
    }
}

/// One position of a key expression, either a scalar or a set of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    One(KeyPart),
    Many(Vec<KeyPart>),
}

impl Component {
    fn values(&self) -> &[KeyPart] {
        match self {
            Component::One(part) => std::slice::from_ref(part),
            Component::Many(parts) => parts,
        }
    }
}

/// Anything usable as one position of a key expression.
pub trait IntoComponent {
    fn into_component(self) -> Component;
}

/// A key expression, expanded by [`expand`] into concrete keys.
///
/// Implemented for scalars, ranges, vectors, tuples of those (up to eight
/// positions), and concrete [`TaskKey`]s.
pub trait KeyExpr {
    fn components(self) -> Vec<Component>;
}

impl IntoComponent for Component {
    fn into_component(self) -> Component {
        self
    }
}

impl IntoComponent for KeyPart {
    fn into_component(self) -> Component {
        Component::One(self)
    }
}

impl<T> IntoComponent for Vec<T>
where
    T: Into<KeyPart>,
{
    fn into_component(self) -> Component {
        Component::Many(self.into_iter().map(Into::into).collect())
    }
}

impl<T> KeyExpr for Vec<T>
where
    T: Into<KeyPart>,
{
    fn components(self) -> Vec<Component> {
        vec![self.into_component()]
    }
}

impl KeyExpr for TaskKey {
    fn components(self) -> Vec<Component> {
        self.0.into_iter().map(Component::One).collect()
    }
}

impl KeyExpr for &TaskKey {
    fn components(self) -> Vec<Component> {
        self.clone().components()
    }
}

impl From<u64> for KeyPart {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(value) => KeyPart::Int(value),
            Err(_) => KeyPart::UInt(value),
        }
    }
}

impl From<usize> for KeyPart {
    fn from(value: usize) -> Self {
        match u64::try_from(value) {
            Ok(value) => KeyPart::from(value),
            Err(_) => KeyPart::UInt(u64::MAX),
        }
    }
}

macro_rules! impl_signed {
    ($($T:ty),*) => {$(
        impl From<$T> for KeyPart {
            fn from(value: $T) -> Self {
                KeyPart::Int(i64::from(value))
            }
        }
    )*};
}

impl_signed!(i32, i64, u32);

macro_rules! impl_int {
    ($($T:ty),*) => {$(

        impl IntoComponent for $T {
            fn into_component(self) -> Component {
                Component::One(self.into())
            }
        }

        impl IntoComponent for Range<$T> {
            fn into_component(self) -> Component {
                Component::Many(self.map(KeyPart::from).collect())
            }
        }

        impl IntoComponent for RangeInclusive<$T> {
            fn into_component(self) -> Component {
                Component::Many(self.map(KeyPart::from).collect())
            }
        }

        impl KeyExpr for $T {
            fn components(self) -> Vec<Component> {
                vec![self.into_component()]
            }
        }

        impl KeyExpr for Range<$T> {
            fn components(self) -> Vec<Component> {
                vec![self.into_component()]
            }
        }

        impl KeyExpr for RangeInclusive<$T> {
            fn components(self) -> Vec<Component> {
                vec![self.into_component()]
            }
        }
    )*};
}

impl_int!(i32, i64, u32, u64, usize);

macro_rules! impl_str {
    ($($T:ty),*) => {$(
        impl IntoComponent for $T {
            fn into_component(self) -> Component {
                Component::One(self.into())
            }
        }

        impl KeyExpr for $T {
            fn components(self) -> Vec<Component> {
                vec![self.into_component()]
            }
        }
    )*};
}

impl_str!(&str, String, Arc<str>);

macro_rules! impl_tuple {
    ($($C:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($C),*> KeyExpr for ($($C,)*)
        where
            $($C: IntoComponent),*
        {
            fn components(self) -> Vec<Component> {
                let ($($C,)*) = self;
                vec![$($C.into_component(),)*]
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);
impl_tuple!(A, B, C, D, E);
impl_tuple!(A, B, C, D, E, F);
impl_tuple!(A, B, C, D, E, F, G);
impl_tuple!(A, B, C, D, E, F, G, H);

/// Expands a key expression into the Cartesian product of its components.
///
/// The first component varies slowest. A multi-valued component with no
/// values makes the whole product empty.
pub fn expand(expr: impl KeyExpr) -> Vec<TaskKey> {
    let mut keys: Vec<Vec<KeyPart>> = vec![vec![]];

    for component in expr.components() {
        let values = component.values();
        let mut next = Vec::with_capacity(keys.len() * values.len());

        for prefix in &keys {
            for value in values {
                let mut key = Vec::with_capacity(prefix.len() + 1);
                key.extend_from_slice(prefix);
                key.push(value.clone());
                next.push(key);
            }
        }

        keys = next;
    }

    keys.into_iter().map(TaskKey).collect()
}

struct SpaceInner {
    name: Arc<str>,
    handles: Mutex<HashMap<TaskKey, TaskHandle>>,
}

/// A named collection of task slots addressed by keys.
///
/// Cloning is cheap and every clone refers to the same slots. A key maps to
/// the same [`TaskHandle`] for the whole lifetime of the space.
#[derive(Clone)]
pub struct TaskSpace(Arc<SpaceInner>);

impl TaskSpace {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(Arc::new(SpaceInner {
            name: name.into(),
            handles: Mutex::new(HashMap::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Returns the handles of every key the expression denotes, creating the
    /// missing ones, in expansion order.
    pub fn resolve(&self, expr: impl KeyExpr) -> Vec<TaskHandle> {
        let keys = expand(expr);
        let mut handles = self
            .0
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        keys.into_iter()
            .map(|key| {
                handles
                    .entry(key)
                    .or_insert_with_key(|key| TaskHandle::keyed(&self.0.name, key.clone()))
                    .clone()
            })
            .collect()
    }

    /// Resolves an expression that must denote exactly one key.
    pub fn get(&self, expr: impl KeyExpr) -> Result<TaskHandle, KeyError> {
        let mut handles = self.resolve(expr);

        match handles.len() {
            1 => Ok(handles.remove(0)),
            n => Err(KeyError::Ambiguous(n)),
        }
    }

    /// Number of keys referenced so far, spawned or not.
    pub fn len(&self) -> usize {
        self.0
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TaskSpace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpace")
            .field("name", &self.0.name)
            .field("len", &self.len())
            .finish()
    }
}
