//! Type erasure for native handlers.
//!
//! A handler is any `Fn` whose arguments implement [`Decode`] and whose return
//! value implements [`IntoReply`]. Registration captures the exact signature;
//! at dispatch time the erased form decodes precisely those arguments from the
//! payload and hands back a [`Job`] that runs the native function off the read
//! loop.

use crate::{
    codec::{encode_to_bytes, Decode, DecodeError, Encode, WireReader},
    error::{ErrorCode, RemoteError},
    registry::ConnectionHandle,
    types::Value,
};
use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fmt::Display,
    future::Future,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::Arc,
};
use tokio::task;

/// Encoded return value, or the error to send back instead.
pub type Reply = Result<Bytes, RemoteError>;

/// Conversion of a handler's return value into a reply payload.
///
/// Fallible handlers return `Result<T, E>`; the error is sent to the caller
/// as an [`ErrorCode::Handler`] error carrying `E`'s `Display` text.
pub trait IntoReply {
    fn into_reply(self) -> Reply;
}

macro_rules! impl_into_reply {
    ($($rust_type:ty),* $(,)?) => {
        $(
            impl IntoReply for $rust_type {
                fn into_reply(self) -> Reply {
                    Ok(encode_to_bytes(&self))
                }
            }
        )*
    };
}

impl_into_reply!(
    (),
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    String,
    &'static str,
    Bytes,
    Value,
);

impl<T: Encode> IntoReply for Vec<T> {
    fn into_reply(self) -> Reply {
        Ok(encode_to_bytes(&self))
    }
}

impl<T: Encode> IntoReply for Option<T> {
    fn into_reply(self) -> Reply {
        Ok(encode_to_bytes(&self))
    }
}

impl<K: Encode, V: Encode, S> IntoReply for HashMap<K, V, S> {
    fn into_reply(self) -> Reply {
        Ok(encode_to_bytes(&self))
    }
}

impl<K: Encode, V: Encode> IntoReply for BTreeMap<K, V> {
    fn into_reply(self) -> Reply {
        Ok(encode_to_bytes(&self))
    }
}

macro_rules! impl_into_reply_tuple {
    ($($name:ident),+) => {
        impl<$($name: Encode),+> IntoReply for ($($name,)+) {
            fn into_reply(self) -> Reply {
                Ok(encode_to_bytes(&self))
            }
        }
    };
}

impl_into_reply_tuple!(A);
impl_into_reply_tuple!(A, B);
impl_into_reply_tuple!(A, B, C);
impl_into_reply_tuple!(A, B, C, D);
impl_into_reply_tuple!(A, B, C, D, E);
impl_into_reply_tuple!(A, B, C, D, E, F);

impl<T: Encode, E: Display> IntoReply for Result<T, E> {
    fn into_reply(self) -> Reply {
        match self {
            Ok(value) => Ok(encode_to_bytes(&value)),
            Err(err) => Err(RemoteError::new(ErrorCode::Handler, err.to_string())),
        }
    }
}

/// Where a call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub connection: ConnectionHandle,
    pub protocol_id: u64,
    pub function_id: u64,
    pub correlation_id: u64,
}

/// A bound invocation, arguments already decoded.
pub enum Job {
    /// Synchronous native code, run on the blocking pool.
    Blocking(Box<dyn FnOnce() -> Reply + Send + 'static>),
    /// A handler future, run as a task.
    Async(BoxFuture<'static, Reply>),
}

impl Job {
    /// Runs the handler. Panics are caught and reported as handler errors.
    pub async fn run(self) -> Reply {
        match self {
            Job::Blocking(f) => match task::spawn_blocking(f).await {
                Ok(reply) => reply,
                Err(err) if err.is_panic() => Err(panicked(err.into_panic())),
                Err(_) => Err(RemoteError::new(ErrorCode::Handler, "handler was cancelled")),
            },
            Job::Async(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(reply) => reply,
                Err(panic) => Err(panicked(panic)),
            },
        }
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> RemoteError {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else {
        "opaque panic payload"
    };
    tracing::error!(panic = %message, "handler panicked");
    RemoteError::new(ErrorCode::Handler, format!("handler panicked: {message}"))
}

/// A native function that can be exposed under a function id.
///
/// `Args` is the tuple of decoded argument types; it is inferred from the
/// function's signature and only exists to keep the per-arity impls apart.
pub trait Handler<Args>: Send + Sync + Sized + 'static {
    fn bind(this: Arc<Self>, ctx: &CallContext, args: &mut WireReader<'_>) -> Result<Job, DecodeError>;
}

/// Marks a function returning a future. See [`Protocol::expose_async`](crate::Protocol::expose_async).
pub struct Async<F>(pub F);

/// Marks a function that takes the caller's [`ConnectionHandle`] as its first
/// argument. See [`Protocol::expose_with_client`](crate::Protocol::expose_with_client).
pub struct WithClient<F>(pub F);

macro_rules! impl_handler {
    ($($arg:ident $var:ident),*) => {
        impl<Func, Ret, $($arg,)*> Handler<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Ret + Send + Sync + 'static,
            Ret: IntoReply + 'static,
            $($arg: Decode + Send + 'static,)*
        {
            fn bind(
                this: Arc<Self>,
                _ctx: &CallContext,
                args: &mut WireReader<'_>,
            ) -> Result<Job, DecodeError> {
                $(let $var = <$arg as Decode>::decode(args)?;)*
                args.finish()?;
                Ok(Job::Blocking(Box::new(move || (*this)($($var),*).into_reply())))
            }
        }

        impl<Func, Fut, Ret, $($arg,)*> Handler<($($arg,)*)> for Async<Func>
        where
            Func: Fn($($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Ret> + Send + 'static,
            Ret: IntoReply + 'static,
            $($arg: Decode + Send + 'static,)*
        {
            fn bind(
                this: Arc<Self>,
                _ctx: &CallContext,
                args: &mut WireReader<'_>,
            ) -> Result<Job, DecodeError> {
                $(let $var = <$arg as Decode>::decode(args)?;)*
                args.finish()?;
                // The closure runs inside the job so a panic before the
                // first await is caught like any other.
                Ok(Job::Async(Box::pin(async move { (this.0)($($var),*).await.into_reply() })))
            }
        }

        impl<Func, Ret, $($arg,)*> Handler<($($arg,)*)> for WithClient<Func>
        where
            Func: Fn(ConnectionHandle, $($arg),*) -> Ret + Send + Sync + 'static,
            Ret: IntoReply + 'static,
            $($arg: Decode + Send + 'static,)*
        {
            fn bind(
                this: Arc<Self>,
                ctx: &CallContext,
                args: &mut WireReader<'_>,
            ) -> Result<Job, DecodeError> {
                let client = ctx.connection;
                $(let $var = <$arg as Decode>::decode(args)?;)*
                args.finish()?;
                Ok(Job::Blocking(Box::new(move || (this.0)(client, $($var),*).into_reply())))
            }
        }
    };
}

impl_handler!();
impl_handler!(A1 a1);
impl_handler!(A1 a1, A2 a2);
impl_handler!(A1 a1, A2 a2, A3 a3);
impl_handler!(A1 a1, A2 a2, A3 a3, A4 a4);
impl_handler!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
impl_handler!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);
impl_handler!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7);
impl_handler!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7, A8 a8);

/// The signature-free form a [`Handler`] is stored as.
pub(crate) trait DynamicCallable: Send + Sync {
    fn bind(&self, ctx: &CallContext, args: &mut WireReader<'_>) -> Result<Job, DecodeError>;
}

pub(crate) struct TypedCallable<H, Args> {
    handler: Arc<H>,
    _args: PhantomData<fn(Args)>,
}

impl<H, Args> TypedCallable<H, Args>
where
    H: Handler<Args>,
{
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            _args: PhantomData,
        }
    }
}

impl<H, Args> DynamicCallable for TypedCallable<H, Args>
where
    H: Handler<Args>,
{
    fn bind(&self, ctx: &CallContext, args: &mut WireReader<'_>) -> Result<Job, DecodeError> {
        H::bind(Arc::clone(&self.handler), ctx, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_bytes, encode_args};

    fn ctx() -> CallContext {
        CallContext {
            connection: ConnectionHandle::new(7),
            protocol_id: 1,
            function_id: 42,
            correlation_id: 1,
        }
    }

    fn bind<H, Args>(handler: H, payload: &Bytes) -> Result<Job, DecodeError>
    where
        H: Handler<Args>,
    {
        let callable = TypedCallable::new(handler);
        callable.bind(&ctx(), &mut WireReader::new(payload))
    }

    #[tokio::test]
    async fn blocking_handler_receives_decoded_arguments() {
        let job = bind(|a: i64, b: i64| a + b, &encode_args(&(2i64, 3i64))).unwrap();
        let reply = job.run().await.unwrap();
        assert_eq!(decode_from_bytes::<i64>(&reply).unwrap(), 5);
    }

    #[tokio::test]
    async fn async_handler_is_awaited() {
        let handler = Async(|name: String| async move { format!("Hello, {name}!") });
        let job = bind(handler, &encode_args(&("world",))).unwrap();
        let reply = job.run().await.unwrap();
        assert_eq!(decode_from_bytes::<String>(&reply).unwrap(), "Hello, world!");
    }

    #[tokio::test]
    async fn client_handle_is_supplied_out_of_band() {
        let handler = WithClient(|client: ConnectionHandle, n: u32| client.as_u64() + u64::from(n));
        let job = bind(handler, &encode_args(&(1u32,))).unwrap();
        let reply = job.run().await.unwrap();
        assert_eq!(decode_from_bytes::<u64>(&reply).unwrap(), 8);
    }

    #[test]
    fn wrong_argument_type_fails_to_bind() {
        let err = bind(|a: i64| a, &encode_args(&("nope",))).err().unwrap();
        assert!(matches!(err, DecodeError::TypeMismatch(_)));
    }

    #[test]
    fn extra_arguments_fail_to_bind() {
        let err = bind(|| (), &encode_args(&(1u8,))).err().unwrap();
        assert_eq!(err, DecodeError::TrailingBytes(2));
    }

    #[tokio::test]
    async fn handler_error_becomes_remote_error() {
        let job = bind(
            |n: i32| if n < 0 { Err("negative") } else { Ok(n) },
            &encode_args(&(-1i32,)),
        )
        .unwrap();
        let err = job.run().await.unwrap_err();
        assert_eq!(err, RemoteError::new(ErrorCode::Handler, "negative"));
    }

    #[tokio::test]
    async fn async_handler_panicking_before_its_future_is_contained() {
        let handler = Async(|n: u32| {
            assert!(n != 0, "zero is not allowed");
            async move { n }
        });
        let job = bind(handler, &encode_args(&(0u32,))).unwrap();
        let err = job.run().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Handler);
        assert!(err.message.contains("zero is not allowed"));
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let job = bind(|| -> i32 { panic!("boom") }, &Bytes::new()).unwrap();
        let err = job.run().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Handler);
        assert!(err.message.contains("boom"));
    }
}
