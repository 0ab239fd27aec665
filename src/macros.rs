/// Implements [`Encode`](crate::Encode), [`Decode`](crate::Decode) and
/// [`IntoReply`](crate::IntoReply) for a plain struct, field by field in the
/// order given.
///
/// ```
/// use rpcservice::wire_struct;
///
/// #[derive(Debug, PartialEq)]
/// pub struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// wire_struct!(Point { x, y });
///
/// let bytes = rpcservice::encode_to_bytes(&Point { x: 1, y: -2 });
/// let back: Point = rpcservice::decode_from_bytes(&bytes).unwrap();
/// assert_eq!(back, Point { x: 1, y: -2 });
/// ```
#[macro_export]
macro_rules! wire_struct {
    ($name:ident { $($field:ident),+ $(,)? }) => {
        impl $crate::Encode for $name {
            fn encode<W: $crate::WireWrite + ?Sized>(&self, w: &mut W) {
                w.put_tag($crate::Type::Struct);
                w.put_len($crate::wire_struct!(@count $($field)+) as usize);
                $( $crate::Encode::encode(&self.$field, w); )+
            }
        }

        impl $crate::Decode for $name {
            fn decode(
                r: &mut $crate::WireReader<'_>,
            ) -> ::std::result::Result<Self, $crate::DecodeError> {
                r.expect_struct($crate::wire_struct!(@count $($field)+))?;
                Ok(Self {
                    $( $field: $crate::Decode::decode(r)?, )+
                })
            }
        }

        impl $crate::IntoReply for $name {
            fn into_reply(self) -> $crate::Reply {
                Ok($crate::encode_to_bytes(&self))
            }
        }
    };
    (@count) => { 0u32 };
    (@count $head:ident $($tail:ident)*) => {
        1u32 + $crate::wire_struct!(@count $($tail)*)
    };
}
