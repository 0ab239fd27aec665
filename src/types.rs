use std::fmt;

/// Wire type tag. Every encoded value starts with one of these bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Type {
    Null = 0x00,
    Bool = 0x01,
    I8 = 0x10,
    I16 = 0x11,
    I32 = 0x12,
    I64 = 0x13,
    U8 = 0x14,
    U16 = 0x15,
    U32 = 0x16,
    U64 = 0x17,
    F32 = 0x20,
    F64 = 0x21,
    String = 0x30,
    Bytes = 0x31,
    Array = 0x40,
    Map = 0x41,
    Struct = 0x50,
}

impl Type {
    pub fn name(&self) -> &'static str {
        use Type::*;
        match self {
            Null => "Null",
            Bool => "Bool",
            I8 => "I8",
            I16 => "I16",
            I32 => "I32",
            I64 => "I64",
            U8 => "U8",
            U16 => "U16",
            U32 => "U32",
            U64 => "U64",
            F32 => "F32",
            F64 => "F64",
            String => "String",
            Bytes => "Bytes",
            Array => "Array",
            Map => "Map",
            Struct => "Struct",
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        use Type::*;
        Some(match tag {
            0x00 => Null,
            0x01 => Bool,
            0x10 => I8,
            0x11 => I16,
            0x12 => I32,
            0x13 => I64,
            0x14 => U8,
            0x15 => U16,
            0x16 => U32,
            0x17 => U64,
            0x20 => F32,
            0x21 => F64,
            0x30 => String,
            0x31 => Bytes,
            0x40 => Array,
            0x41 => Map,
            0x50 => Struct,
            _ => return None,
        })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dynamically typed wire value.
///
/// Decoding into `Value` accepts any tag, which makes it useful for generic
/// tooling and for peers that do not know the exact result type up front.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Struct(Vec<Value>),
}

impl Value {
    pub fn rpc_type(&self) -> Type {
        match self {
            Value::Null => Type::Null,
            Value::Bool(_) => Type::Bool,
            Value::I8(_) => Type::I8,
            Value::I16(_) => Type::I16,
            Value::I32(_) => Type::I32,
            Value::I64(_) => Type::I64,
            Value::U8(_) => Type::U8,
            Value::U16(_) => Type::U16,
            Value::U32(_) => Type::U32,
            Value::U64(_) => Type::U64,
            Value::F32(_) => Type::F32,
            Value::F64(_) => Type::F64,
            Value::String(_) => Type::String,
            Value::Bytes(_) => Type::Bytes,
            Value::Array(_) => Type::Array,
            Value::Map(_) => Type::Map,
            Value::Struct(_) => Type::Struct,
        }
    }
}

macro_rules! impl_value_from {
    ($($rust_type:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$rust_type> for Value {
                fn from(v: $rust_type) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_value_from!(
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    Vec<Value> => Array,
);

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

/// The tag read from the wire is not the one the call site expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMismatch {
    pub expected: Type,
    pub found: Type,
}

impl TypeMismatch {
    pub(crate) fn new(expected: Type, found: Type) -> Self {
        Self { expected, found }
    }
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.found)
    }
}

impl std::error::Error for TypeMismatch {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Type::Null)]
    #[case(Type::I64)]
    #[case(Type::U8)]
    #[case(Type::F64)]
    #[case(Type::Bytes)]
    #[case(Type::Struct)]
    fn tag_maps_back_to_type(#[case] typ: Type) {
        assert_eq!(Type::from_tag(typ.tag()), Some(typ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(Type::from_tag(0xff), None);
        assert_eq!(Type::from_tag(0x18), None);
    }

    #[test]
    fn value_reports_its_type() {
        assert_eq!(Value::from("x").rpc_type(), Type::String);
        assert_eq!(Value::from(10i64).rpc_type(), Type::I64);
        assert_eq!(Value::from(()).rpc_type(), Type::Null);
    }
}
