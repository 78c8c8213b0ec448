//! Message values
//!
//! [`Value`] is the graph a context exchanges with its workers. Arrays,
//! objects and byte buffers are reference types: two slots may point at the
//! same node and a node may (indirectly) contain itself. [`SharedBuffer`] is
//! the only kind shared across threads instead of copied.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::RwLock;

/// Byte buffer visible to every context holding a handle
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<RwLock<Vec<u8>>>);

impl SharedBuffer {
    /// Zero-filled buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(Arc::new(RwLock::new(bytes)))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.0.read().get(index).copied()
    }

    /// Store `byte` at `index`. Returns false when out of bounds.
    pub fn set(&self, index: usize, byte: u8) -> bool {
        match self.0.write().get_mut(index) {
            Some(slot) => {
                *slot = byte;
                true
            }
            None => false,
        }
    }

    /// Run `f` with shared access to the bytes
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.0.read())
    }

    /// Run `f` with exclusive access to the bytes
    pub fn write<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.0.write())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.read().clone()
    }

    /// Whether both handles refer to the same storage
    pub fn ptr_eq(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedBuffer({} bytes)", self.len())
    }
}

/// A host function. Never leaves the context that created it.
#[derive(Clone)]
pub struct NativeFunction {
    name: String,
    func: Rc<dyn Fn(&[Value]) -> Value>,
}

impl NativeFunction {
    pub fn new(name: impl Into<String>, func: impl Fn(&[Value]) -> Value + 'static) -> Self {
        Self {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> Value {
        (self.func)(args)
    }
}

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
pub type ObjectRef = Rc<RefCell<BTreeMap<String, Value>>>;
pub type BytesRef = Rc<RefCell<Vec<u8>>>;

/// A message value
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(i128),
    String(String),
    Array(ArrayRef),
    Object(ObjectRef),
    Bytes(BytesRef),
    Shared(SharedBuffer),
    Function(NativeFunction),
    /// An open descriptor; only meaningful in the owning process context
    Descriptor(RawFd),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let map = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Value::Object(Rc::new(RefCell::new(map)))
    }

    pub fn bytes(data: Vec<u8>) -> Self {
        Value::Bytes(Rc::new(RefCell::new(data)))
    }

    /// Name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Bytes(_) => "bytes",
            Value::Shared(_) => "shared buffer",
            Value::Function(_) => "function",
            Value::Descriptor(_) => "descriptor",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_shared(&self) -> Option<&SharedBuffer> {
        match self {
            Value::Shared(buf) => Some(buf),
            _ => None,
        }
    }

    /// Element `index` of an array
    pub fn index(&self, index: usize) -> Option<Value> {
        self.as_array()?.borrow().get(index).cloned()
    }

    /// Property `key` of an object
    pub fn get(&self, key: &str) -> Option<Value> {
        self.as_object()?.borrow().get(key).cloned()
    }

    /// Append to an array. Returns false for non-arrays.
    pub fn push(&self, value: Value) -> bool {
        match self.as_array() {
            Some(items) => {
                items.borrow_mut().push(value);
                true
            }
            None => false,
        }
    }

    /// Set a property of an object. Returns false for non-objects.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> bool {
        match self.as_object() {
            Some(map) => {
                map.borrow_mut().insert(key.into(), value);
                true
            }
            None => false,
        }
    }

    /// Whether both values are the same reference-type node
    pub fn same_ref(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Bytes(a), Value::Bytes(b)) => Rc::ptr_eq(a, b),
            (Value::Shared(a), Value::Shared(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Address of the node for reference types
    pub(crate) fn node_ptr(&self) -> Option<*const ()> {
        match self {
            Value::Array(rc) => Some(Rc::as_ptr(rc) as *const ()),
            Value::Object(rc) => Some(Rc::as_ptr(rc) as *const ()),
            Value::Bytes(rc) => Some(Rc::as_ptr(rc) as *const ()),
            _ => None,
        }
    }

    /// Deep equality that terminates on cyclic graphs.
    ///
    /// NaN equals NaN, and shared buffers are equal only when they are the
    /// same buffer.
    pub fn structural_eq(&self, other: &Value) -> bool {
        structural_eq(self, other, &mut HashSet::new())
    }
}

fn structural_eq(a: &Value, b: &Value, assumed: &mut HashSet<(usize, usize)>) -> bool {
    if let (Some(pa), Some(pb)) = (a.node_ptr(), b.node_ptr()) {
        // A pair already under comparison is assumed equal
        if !assumed.insert((pa as usize, pb as usize)) {
            return true;
        }
    }

    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(a, b)| structural_eq(a, b, assumed))
        }
        (Value::Object(x), Value::Object(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((ka, a), (kb, b))| ka == kb && structural_eq(a, b, assumed))
        }
        (Value::Bytes(x), Value::Bytes(y)) => *x.borrow() == *y.borrow(),
        (Value::Shared(x), Value::Shared(y)) => x.ptr_eq(y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(&x.func, &y.func),
        (Value::Descriptor(x), Value::Descriptor(y)) => x == y,
        _ => false,
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_value(self, f, &mut Vec::new())
    }
}

fn debug_value(
    value: &Value,
    f: &mut fmt::Formatter<'_>,
    stack: &mut Vec<*const ()>,
) -> fmt::Result {
    if let Some(ptr) = value.node_ptr() {
        if stack.contains(&ptr) {
            return f.write_str("[Circular]");
        }
        stack.push(ptr);
    }

    let result = match value {
        Value::Undefined => f.write_str("undefined"),
        Value::Null => f.write_str("null"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Int(n) => write!(f, "{}", n),
        Value::Float(x) => write!(f, "{:?}", x),
        Value::BigInt(n) => write!(f, "{}n", n),
        Value::String(s) => write!(f, "{:?}", s),
        Value::Array(items) => {
            f.write_str("[")?;
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                debug_value(item, f, stack)?;
            }
            f.write_str("]")
        }
        Value::Object(map) => {
            f.write_str("{")?;
            for (i, (key, item)) in map.borrow().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}: ", key)?;
                debug_value(item, f, stack)?;
            }
            f.write_str("}")
        }
        Value::Bytes(data) => write!(f, "Bytes({} bytes)", data.borrow().len()),
        Value::Shared(buf) => write!(f, "{:?}", buf),
        Value::Function(func) => write!(f, "[Function {}]", func.name),
        Value::Descriptor(fd) => write!(f, "[Descriptor {}]", fd),
    };

    if value.node_ptr().is_some() {
        stack.pop();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_buffer_handles_alias() {
        let buf = SharedBuffer::new(4);
        let alias = buf.clone();
        assert!(alias.set(2, 9));
        assert_eq!(buf.get(2), Some(9));
        assert!(!buf.set(4, 1));
        assert!(buf.ptr_eq(&alias));
        assert!(!buf.ptr_eq(&SharedBuffer::new(4)));
    }

    #[test]
    fn test_object_access() {
        let obj = Value::object([("a", Value::Int(1))]);
        obj.insert("b", Value::string("x"));
        assert_eq!(obj.get("a").and_then(|v| v.as_int()), Some(1));
        assert_eq!(obj.get("b").unwrap().as_str(), Some("x"));
        assert!(obj.get("c").is_none());
        assert!(!Value::Null.insert("k", Value::Null));
    }

    #[test]
    fn test_structural_eq_cyclic() {
        let a = Value::array(vec![Value::Int(1)]);
        a.push(a.clone());
        let b = Value::array(vec![Value::Int(1)]);
        b.push(b.clone());
        assert!(a.structural_eq(&b));

        let c = Value::array(vec![Value::Int(2)]);
        c.push(c.clone());
        assert!(!a.structural_eq(&c));
    }

    #[test]
    fn test_nan_equal() {
        assert!(Value::Float(f64::NAN).structural_eq(&Value::Float(f64::NAN)));
        assert!(!Value::Int(1).structural_eq(&Value::Float(1.0)));
    }

    #[test]
    fn test_debug_marks_cycles() {
        let obj = Value::object([("n", Value::Int(3))]);
        obj.insert("me", obj.clone());
        assert_eq!(format!("{:?}", obj), "{me: [Circular], n: 3}");

        let shared = Value::array(vec![]);
        let twice = Value::array(vec![shared.clone(), shared]);
        assert_eq!(format!("{:?}", twice), "[[], []]");
    }
}
