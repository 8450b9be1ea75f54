//! Runtime values
//!
//! [`Value`] is a small `Copy` enum. Scalars are stored inline; everything
//! that lives on the heap is referenced through a [`Handle`] into the arena
//! owned by the garbage collector, so values never alias raw memory.

pub mod number;
mod object;
mod table;

pub use object::{
    Buffer, Destructor, Function, LoadedProto, LuaClosure, LuaString, NativeClosure, NativeFn,
    Object, ThreadObject, Upvalue, Userdata,
};
pub use table::{Table, TableError, TableKey};

use std::fmt;

use crate::gc::Handle;

/// A three-component single precision vector
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn magnitude(self) -> f32 {
        self.dot(self).sqrt()
    }

    #[must_use]
    pub fn dot(self, other: Vector) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[must_use]
    pub fn map(self, f: impl Fn(f32) -> f32) -> Vector {
        Vector::new(f(self.x), f(self.y), f(self.z))
    }

    #[must_use]
    pub fn zip(self, other: Vector, f: impl Fn(f32, f32) -> f32) -> Vector {
        Vector::new(f(self.x, other.x), f(self.y, other.y), f(self.z, other.z))
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}",
            number::format_number(f64::from(self.x)),
            number::format_number(f64::from(self.y)),
            number::format_number(f64::from(self.z))
        )
    }
}

/// Type tag of a value or heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Nil,
    Boolean,
    LightUserdata,
    Number,
    Integer,
    UnsignedInteger,
    Vector,
    String,
    Table,
    Function,
    Userdata,
    Thread,
    Buffer,
    /// Function prototype; collector internal
    Proto,
    /// Captured variable cell; collector internal
    Upvalue,
}

impl Tag {
    /// Script-visible type name, as returned by `type()`
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Tag::Nil => "nil",
            Tag::Boolean => "boolean",
            Tag::LightUserdata | Tag::Userdata => "userdata",
            Tag::Number | Tag::Integer | Tag::UnsignedInteger => "number",
            Tag::Vector => "vector",
            Tag::String => "string",
            Tag::Table => "table",
            Tag::Function => "function",
            Tag::Thread => "thread",
            Tag::Buffer => "buffer",
            Tag::Proto => "proto",
            Tag::Upvalue => "upvalue",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A runtime value
#[derive(Debug, Clone, Copy, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    /// Opaque host pointer-sized integer
    LightUserdata(usize),
    Number(f64),
    Integer(i32),
    UnsignedInteger(u32),
    Vector(Vector),
    String(Handle),
    Table(Handle),
    Function(Handle),
    Userdata(Handle),
    Thread(Handle),
    Buffer(Handle),
}

impl Value {
    #[must_use]
    pub const fn tag(&self) -> Tag {
        match self {
            Value::Nil => Tag::Nil,
            Value::Boolean(_) => Tag::Boolean,
            Value::LightUserdata(_) => Tag::LightUserdata,
            Value::Number(_) => Tag::Number,
            Value::Integer(_) => Tag::Integer,
            Value::UnsignedInteger(_) => Tag::UnsignedInteger,
            Value::Vector(_) => Tag::Vector,
            Value::String(_) => Tag::String,
            Value::Table(_) => Tag::Table,
            Value::Function(_) => Tag::Function,
            Value::Userdata(_) => Tag::Userdata,
            Value::Thread(_) => Tag::Thread,
            Value::Buffer(_) => Tag::Buffer,
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.tag().name()
    }

    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Only `nil` and `false` are falsy
    #[must_use]
    pub const fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Numeric value of any of the three number variants
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            Value::Number(n) => Some(n),
            Value::Integer(i) => Some(f64::from(i)),
            Value::UnsignedInteger(u) => Some(f64::from(u)),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_number(&self) -> bool {
        matches!(self, Value::Number(_) | Value::Integer(_) | Value::UnsignedInteger(_))
    }

    /// Heap handle for collectable values
    #[must_use]
    pub const fn handle(&self) -> Option<Handle> {
        match *self {
            Value::String(h)
            | Value::Table(h)
            | Value::Function(h)
            | Value::Userdata(h)
            | Value::Thread(h)
            | Value::Buffer(h) => Some(h),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_table(&self) -> Option<Handle> {
        match *self {
            Value::Table(h) => Some(h),
            _ => None,
        }
    }

    /// Primitive equality: numbers by value across variants, vectors by
    /// component, heap objects by identity. Strings are interned, so
    /// identity is content equality.
    #[must_use]
    pub fn raw_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::LightUserdata(a), Value::LightUserdata(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::String(a), Value::String(b))
            | (Value::Table(a), Value::Table(b))
            | (Value::Function(a), Value::Function(b))
            | (Value::Userdata(a), Value::Userdata(b))
            | (Value::Thread(a), Value::Thread(b))
            | (Value::Buffer(a), Value::Buffer(b)) => a == b,
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<Vector> for Value {
    fn from(v: Vector) -> Self {
        Value::Vector(v)
    }
}
