//! Type-tagged binary encoding.
//!
//! Every value is written as a one byte [`Type`] tag followed by its body.
//! Fixed width numbers are little-endian, strings and byte strings carry a
//! `u32` length prefix, and containers carry a `u32` element count with every
//! element tagged on its own. Decoding checks each tag against the type the
//! call site asks for, so a peer running a different signature gets a
//! [`DecodeError::TypeMismatch`] instead of garbage.

use crate::types::{Type, TypeMismatch, Value};
use bytes::{Bytes, BytesMut};
use std::{
    collections::{BTreeMap, HashMap},
    hash::{BuildHasher, Hash},
};
use thiserror::Error;

/// Nesting limit when decoding dynamically typed [`Value`]s.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("type mismatch: {0}")]
    TypeMismatch(#[from] TypeMismatch),

    #[error("buffer underrun: needed {needed} bytes, {remaining} remaining")]
    BufferUnderrun { needed: usize, remaining: usize },

    #[error("invalid type tag {0:#04x}")]
    InvalidTag(u8),

    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: u32, found: u32 },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("value nesting too deep")]
    TooDeep,
}

/// Sink for encoded bytes.
///
/// Implemented by byte buffers and by [`SizeCounter`], which only measures.
pub trait WireWrite {
    fn write_raw(&mut self, src: &[u8]);

    fn put_tag(&mut self, typ: Type) {
        self.write_raw(&[typ.tag()]);
    }

    /// Writes a `u32` length or element count.
    fn put_len(&mut self, len: usize) {
        debug_assert!(u32::try_from(len).is_ok(), "length {len} exceeds u32");
        self.write_raw(&(len as u32).to_le_bytes());
    }
}

impl WireWrite for BytesMut {
    fn write_raw(&mut self, src: &[u8]) {
        self.extend_from_slice(src);
    }
}

impl WireWrite for Vec<u8> {
    fn write_raw(&mut self, src: &[u8]) {
        self.extend_from_slice(src);
    }
}

/// Computes the encoded size of a value without producing any bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeCounter {
    size: usize,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl WireWrite for SizeCounter {
    fn write_raw(&mut self, src: &[u8]) {
        self.size += src.len();
    }
}

/// Cursor over an encoded buffer.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(DecodeError::BufferUnderrun {
                needed: n,
                remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn peek_type(&self) -> Result<Type, DecodeError> {
        let tag = *self.buf.get(self.pos).ok_or(DecodeError::BufferUnderrun {
            needed: 1,
            remaining: 0,
        })?;
        Type::from_tag(tag).ok_or(DecodeError::InvalidTag(tag))
    }

    pub fn read_type(&mut self) -> Result<Type, DecodeError> {
        let typ = self.peek_type()?;
        self.pos += 1;
        Ok(typ)
    }

    pub fn expect_type(&mut self, expected: Type) -> Result<(), DecodeError> {
        let found = self.read_type()?;
        if found != expected {
            return Err(TypeMismatch::new(expected, found).into());
        }
        Ok(())
    }

    /// Reads a byte length and checks that many bytes are actually present.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_u32()? as usize;
        let remaining = self.remaining();
        if len > remaining {
            return Err(DecodeError::BufferUnderrun {
                needed: len,
                remaining,
            });
        }
        Ok(len)
    }

    /// Reads an element count. Every element is at least one tag byte long,
    /// so counts larger than the remaining input are rejected up front.
    pub fn read_count(&mut self) -> Result<usize, DecodeError> {
        self.read_len()
    }

    pub fn expect_struct(&mut self, expected: u32) -> Result<(), DecodeError> {
        self.expect_type(Type::Struct)?;
        let found = self.read_u32()?;
        if found != expected {
            return Err(DecodeError::FieldCount { expected, found });
        }
        Ok(())
    }

    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    fn descend(&mut self) -> Result<(), DecodeError> {
        if self.depth >= MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }
        self.depth += 1;
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }
}

pub trait Encode {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W);
}

pub trait Decode: Sized {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError>;
}

/// An argument list: the values are written back to back, each with its own
/// tag, and the callee decodes exactly as many as its signature declares.
pub trait Args {
    fn encode_args<W: WireWrite + ?Sized>(&self, w: &mut W);
}

/// Encodes `value`, sizing the buffer with a [`SizeCounter`] pass first.
pub fn encode_to_bytes<T: Encode + ?Sized>(value: &T) -> Bytes {
    let mut counter = SizeCounter::new();
    value.encode(&mut counter);
    let mut buf = BytesMut::with_capacity(counter.size());
    value.encode(&mut buf);
    buf.freeze()
}

pub fn encode_args<A: Args + ?Sized>(args: &A) -> Bytes {
    let mut counter = SizeCounter::new();
    args.encode_args(&mut counter);
    let mut buf = BytesMut::with_capacity(counter.size());
    args.encode_args(&mut buf);
    buf.freeze()
}

/// Decodes a single value that must span the whole buffer.
pub fn decode_from_bytes<T: Decode>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut reader = WireReader::new(bytes);
    let value = T::decode(&mut reader)?;
    reader.finish()?;
    Ok(value)
}

macro_rules! impl_fixed_width {
    ($($rust_type:ty => $typ:ident),* $(,)?) => {
        $(
            impl Encode for $rust_type {
                fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
                    w.put_tag(Type::$typ);
                    w.write_raw(&self.to_le_bytes());
                }
            }

            impl Decode for $rust_type {
                fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
                    r.expect_type(Type::$typ)?;
                    Ok(<$rust_type>::from_le_bytes(r.read_array()?))
                }
            }
        )*
    };
}

// Floats go through to_le_bytes as well, so NaN payloads survive bit for bit.
impl_fixed_width!(
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
);

impl Encode for bool {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        w.put_tag(Type::Bool);
        w.write_raw(&[u8::from(*self)]);
    }
}

impl Decode for bool {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.expect_type(Type::Bool)?;
        match r.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }
}

impl Encode for () {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        w.put_tag(Type::Null);
    }
}

impl Decode for () {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.expect_type(Type::Null)
    }
}

impl Encode for str {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        w.put_tag(Type::String);
        w.put_len(self.len());
        w.write_raw(self.as_bytes());
    }
}

impl Encode for String {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        self.as_str().encode(w);
    }
}

impl Decode for String {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.expect_type(Type::String)?;
        let len = r.read_len()?;
        let raw = r.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}

impl Encode for Bytes {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        w.put_tag(Type::Bytes);
        w.put_len(self.len());
        w.write_raw(self);
    }
}

impl Decode for Bytes {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.expect_type(Type::Bytes)?;
        let len = r.read_len()?;
        Ok(Bytes::copy_from_slice(r.take(len)?))
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        (**self).encode(w);
    }
}

impl<T: Encode> Encode for [T] {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        w.put_tag(Type::Array);
        w.put_len(self.len());
        for item in self {
            item.encode(w);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        self.as_slice().encode(w);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.expect_type(Type::Array)?;
        let count = r.read_count()?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        match self {
            Some(value) => value.encode(w),
            None => w.put_tag(Type::Null),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        if r.peek_type()? == Type::Null {
            r.read_type()?;
            return Ok(None);
        }
        T::decode(r).map(Some)
    }
}

fn encode_map<'m, K, V, W, I>(w: &mut W, len: usize, entries: I)
where
    K: Encode + 'm,
    V: Encode + 'm,
    W: WireWrite + ?Sized,
    I: Iterator<Item = (&'m K, &'m V)>,
{
    w.put_tag(Type::Map);
    w.put_len(len);
    for (key, value) in entries {
        key.encode(w);
        value.encode(w);
    }
}

impl<K: Encode, V: Encode, S> Encode for HashMap<K, V, S> {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        encode_map(w, self.len(), self.iter());
    }
}

impl<K, V, S> Decode for HashMap<K, V, S>
where
    K: Decode + Eq + Hash,
    V: Decode,
    S: BuildHasher + Default,
{
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.expect_type(Type::Map)?;
        let count = r.read_count()?;
        let mut out = HashMap::with_capacity_and_hasher(count, S::default());
        for _ in 0..count {
            let key = K::decode(r)?;
            let value = V::decode(r)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        encode_map(w, self.len(), self.iter());
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.expect_type(Type::Map)?;
        let count = r.read_count()?;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let key = K::decode(r)?;
            let value = V::decode(r)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

impl Encode for Value {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
        match self {
            Value::Null => w.put_tag(Type::Null),
            Value::Bool(v) => v.encode(w),
            Value::I8(v) => v.encode(w),
            Value::I16(v) => v.encode(w),
            Value::I32(v) => v.encode(w),
            Value::I64(v) => v.encode(w),
            Value::U8(v) => v.encode(w),
            Value::U16(v) => v.encode(w),
            Value::U32(v) => v.encode(w),
            Value::U64(v) => v.encode(w),
            Value::F32(v) => v.encode(w),
            Value::F64(v) => v.encode(w),
            Value::String(v) => v.encode(w),
            Value::Bytes(v) => {
                w.put_tag(Type::Bytes);
                w.put_len(v.len());
                w.write_raw(v);
            }
            Value::Array(items) => items.encode(w),
            Value::Map(entries) => encode_map(w, entries.len(), entries.iter().map(|(k, v)| (k, v))),
            Value::Struct(fields) => {
                w.put_tag(Type::Struct);
                w.put_len(fields.len());
                for field in fields {
                    field.encode(w);
                }
            }
        }
    }
}

impl Decode for Value {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        r.descend()?;
        let value = decode_value(r);
        r.ascend();
        value
    }
}

fn decode_value(r: &mut WireReader<'_>) -> Result<Value, DecodeError> {
    Ok(match r.peek_type()? {
        Type::Null => {
            r.read_type()?;
            Value::Null
        }
        Type::Bool => Value::Bool(bool::decode(r)?),
        Type::I8 => Value::I8(i8::decode(r)?),
        Type::I16 => Value::I16(i16::decode(r)?),
        Type::I32 => Value::I32(i32::decode(r)?),
        Type::I64 => Value::I64(i64::decode(r)?),
        Type::U8 => Value::U8(u8::decode(r)?),
        Type::U16 => Value::U16(u16::decode(r)?),
        Type::U32 => Value::U32(u32::decode(r)?),
        Type::U64 => Value::U64(u64::decode(r)?),
        Type::F32 => Value::F32(f32::decode(r)?),
        Type::F64 => Value::F64(f64::decode(r)?),
        Type::String => Value::String(String::decode(r)?),
        Type::Bytes => Value::Bytes(Bytes::decode(r)?.to_vec()),
        Type::Array => Value::Array(Vec::<Value>::decode(r)?),
        Type::Map => {
            r.read_type()?;
            let count = r.read_count()?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = Value::decode(r)?;
                let value = Value::decode(r)?;
                entries.push((key, value));
            }
            Value::Map(entries)
        }
        Type::Struct => {
            r.read_type()?;
            let count = r.read_count()?;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(Value::decode(r)?);
            }
            Value::Struct(fields)
        }
    })
}

impl Args for () {
    fn encode_args<W: WireWrite + ?Sized>(&self, _w: &mut W) {}
}

macro_rules! impl_tuple {
    ($len:expr; $($name:ident $idx:tt),+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) {
                w.put_tag(Type::Struct);
                w.put_len($len);
                $(self.$idx.encode(w);)+
            }
        }

        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
                r.expect_struct($len)?;
                Ok(($($name::decode(r)?,)+))
            }
        }

        impl<$($name: Encode),+> Args for ($($name,)+) {
            fn encode_args<W: WireWrite + ?Sized>(&self, w: &mut W) {
                $(self.$idx.encode(w);)+
            }
        }
    };
}

impl_tuple!(1; A 0);
impl_tuple!(2; A 0, B 1);
impl_tuple!(3; A 0, B 1, C 2);
impl_tuple!(4; A 0, B 1, C 2, D 3);
impl_tuple!(5; A 0, B 1, C 2, D 3, E 4);
impl_tuple!(6; A 0, B 1, C 2, D 3, E 4, F 5);
impl_tuple!(7; A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_tuple!(8; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn roundtrip<T: Encode + Decode>(value: &T) -> T {
        let bytes = encode_to_bytes(value);
        decode_from_bytes(&bytes).unwrap()
    }

    #[rstest]
    #[case(0i64)]
    #[case(i64::MAX)]
    #[case(i64::MIN)]
    #[case(-1i64)]
    fn signed_boundaries_roundtrip(#[case] value: i64) {
        assert_eq!(roundtrip(&value), value);
    }

    #[rstest]
    #[case(0u64)]
    #[case(u64::MAX)]
    fn unsigned_boundaries_roundtrip(#[case] value: u64) {
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn integers_are_little_endian_and_tagged() {
        let bytes = encode_to_bytes(&0x0102_0304u32);
        assert_eq!(&bytes[..], &[Type::U32.tag(), 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn nan_survives_bit_for_bit() {
        let nan = f64::from_bits(0x7ff8_0000_0000_beef);
        assert_eq!(roundtrip(&nan).to_bits(), nan.to_bits());
        assert_eq!(roundtrip(&-0.0f32).to_bits(), (-0.0f32).to_bits());
    }

    #[test]
    fn strings_keep_embedded_nul() {
        let s = String::from("a\0b\0");
        assert_eq!(roundtrip(&s), s);
        assert_eq!(roundtrip(&String::new()), "");
    }

    #[test]
    fn nested_sequences_roundtrip() {
        let nested: Vec<Vec<i32>> = vec![vec![], vec![1, 2], vec![-3]];
        assert_eq!(roundtrip(&nested), nested);
        assert_eq!(roundtrip(&Vec::<u8>::new()), Vec::<u8>::new());
    }

    #[test]
    fn maps_and_options_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), Some(1u16));
        map.insert("b".to_owned(), None);
        assert_eq!(roundtrip(&map), map);
    }

    #[test]
    fn tuples_roundtrip_as_structs() {
        let value = (1u8, "two".to_owned(), vec![3.0f64]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn size_counter_matches_encoded_length() {
        let value = (vec![1i64, 2, 3], "hello".to_owned());
        let mut counter = SizeCounter::new();
        value.encode(&mut counter);
        assert_eq!(counter.size(), encode_to_bytes(&value).len());
    }

    #[test]
    fn wrong_tag_is_a_type_mismatch() {
        let bytes = encode_to_bytes(&"x");
        let err = decode_from_bytes::<i64>(&bytes).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TypeMismatch(TypeMismatch::new(Type::I64, Type::String))
        );
    }

    #[test]
    fn signedness_is_part_of_the_tag() {
        let bytes = encode_to_bytes(&5u32);
        assert!(matches!(
            decode_from_bytes::<i32>(&bytes),
            Err(DecodeError::TypeMismatch(_))
        ));
    }

    #[test]
    fn truncated_input_is_an_underrun() {
        let bytes = encode_to_bytes(&42u64);
        let err = decode_from_bytes::<u64>(&bytes[..5]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::BufferUnderrun {
                needed: 8,
                remaining: 4
            }
        );
    }

    #[test]
    fn oversized_length_prefix_fails_before_allocating() {
        let mut raw = vec![Type::Array.tag()];
        raw.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_from_bytes::<Vec<u8>>(&raw),
            Err(DecodeError::BufferUnderrun { .. })
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(
            decode_from_bytes::<Value>(&[0xee]),
            Err(DecodeError::InvalidTag(0xee))
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut raw = encode_to_bytes(&1u8).to_vec();
        raw.push(0);
        assert_eq!(
            decode_from_bytes::<u8>(&raw),
            Err(DecodeError::TrailingBytes(1))
        );
    }

    #[test]
    fn struct_field_count_is_checked() {
        let bytes = encode_to_bytes(&(1u8, 2u8, 3u8));
        assert_eq!(
            decode_from_bytes::<(u8, u8)>(&bytes),
            Err(DecodeError::FieldCount {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn deeply_nested_values_are_rejected() {
        let mut raw = Vec::new();
        for _ in 0..=MAX_DEPTH {
            raw.push(Type::Array.tag());
            raw.extend_from_slice(&1u32.to_le_bytes());
        }
        raw.push(Type::Null.tag());
        assert_eq!(decode_from_bytes::<Value>(&raw), Err(DecodeError::TooDeep));
    }

    #[test]
    fn typed_values_decode_dynamically() {
        let bytes = encode_to_bytes(&(7i32, vec!["a".to_owned()]));
        let value: Value = decode_from_bytes(&bytes).unwrap();
        assert_eq!(
            value,
            Value::Struct(vec![
                Value::I32(7),
                Value::Array(vec![Value::String("a".into())])
            ])
        );
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i8>().prop_map(Value::I8),
            any::<i64>().prop_map(Value::I64),
            any::<u16>().prop_map(Value::U16),
            any::<u64>().prop_map(Value::U64),
            any::<f64>()
                .prop_filter("NaN never compares equal", |f| !f.is_nan())
                .prop_map(Value::F64),
            ".*".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Struct),
                proptest::collection::vec((inner.clone(), inner), 0..4).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn any_value_roundtrips(value in arb_value()) {
            let bytes = encode_to_bytes(&value);
            prop_assert_eq!(decode_from_bytes::<Value>(&bytes), Ok(value));
        }

        #[test]
        fn decoding_arbitrary_bytes_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode_from_bytes::<Value>(&raw);
        }
    }
}
