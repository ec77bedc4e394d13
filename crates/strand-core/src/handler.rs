//! Typed method handlers.
//!
//! Hub methods are plain async closures. Registration wraps them into the
//! uniform invoker the dispatcher runs, by way of two small trait families:
//! [`HubParam`] decodes one parameter (a serde-decoded value or a bound
//! upload stream, distinguished by a marker type), and
//! [`IntoInvocationOutput`] lifts the return value (single value, fallible
//! result, or server stream) into [`InvocationOutput`]. An arity macro ties
//! the families together for signatures with and without a leading
//! [`HubContext`].

use std::future::Future;

use futures_util::future::{ready, BoxFuture};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::HubContext;
use crate::error::{DispatchError, HubError};
use crate::hub::{InvocationOutput, InvocationRequest, ResultKind};
use crate::streams::{ServerStream, UploadSource, UploadStream};

/// The shape a handler declared at registration: how many arguments to
/// expect from the wire, how many upload streams to bind, and what comes
/// back.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSpec {
    pub value_params: usize,
    pub stream_params: usize,
    pub takes_context: bool,
    pub result: ResultKind,
}

/// Walks an invocation's arguments and bound streams during extraction.
pub struct ExtractCx {
    target: String,
    context: HubContext,
    arguments: std::vec::IntoIter<Value>,
    streams: std::vec::IntoIter<UploadSource>,
    index: usize,
}

impl ExtractCx {
    fn new(request: InvocationRequest) -> Self {
        Self {
            target: request.target,
            context: request.context,
            arguments: request.arguments.into_iter(),
            streams: request.streams.into_iter(),
            index: 0,
        }
    }

    fn context(&self) -> HubContext {
        self.context.clone()
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn next_value(&mut self) -> Result<(usize, Value), DispatchError> {
        let index = self.index;
        self.index += 1;
        match self.arguments.next() {
            Some(value) => Ok((index, value)),
            None => Err(DispatchError::Argument {
                target: self.target.clone(),
                index,
                detail: "missing argument".into(),
            }),
        }
    }

    fn next_stream(&mut self) -> Result<UploadSource, DispatchError> {
        self.streams.next().ok_or_else(|| DispatchError::Argument {
            target: self.target.clone(),
            index: self.index,
            detail: "missing upload stream".into(),
        })
    }
}

/// One method parameter, extracted from an invocation. The marker type `M`
/// keeps the value and stream families of implementations apart.
pub trait HubParam<M>: Sized + Send + 'static {
    /// Whether this parameter binds a `streamIds` entry instead of an
    /// `arguments` entry.
    const IS_STREAM: bool;

    /// Extract the parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if the argument cannot be decoded; the message is
    /// sent as the completion error and the method is not called.
    fn extract(cx: &mut ExtractCx) -> Result<Self, DispatchError>;
}

/// Marker: parameter decoded from the arguments array.
pub struct ViaValue;

/// Marker: parameter bound from the invocation's stream ids.
pub struct ViaStream;

impl<T> HubParam<ViaValue> for T
where
    T: DeserializeOwned + Send + 'static,
{
    const IS_STREAM: bool = false;

    fn extract(cx: &mut ExtractCx) -> Result<Self, DispatchError> {
        let (index, value) = cx.next_value()?;
        serde_json::from_value(value).map_err(|e| DispatchError::Argument {
            target: cx.target().to_owned(),
            index,
            detail: e.to_string(),
        })
    }
}

impl<T> HubParam<ViaStream> for UploadStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    const IS_STREAM: bool = true;

    fn extract(cx: &mut ExtractCx) -> Result<Self, DispatchError> {
        Ok(UploadStream::new(cx.next_stream()?))
    }
}

/// A method return value, lifted into the uniform invocation output. The
/// marker type `M` keeps the overlapping families apart.
pub trait IntoInvocationOutput<M>: Send + 'static {
    /// Whether this return shape streams.
    const KIND: ResultKind;

    fn into_output(self) -> InvocationOutput;
}

/// Marker: any serializable value, including unit and tuples.
pub struct AsValue;

/// Marker: fallible single result.
pub struct AsResult;

/// Marker: server stream.
pub struct AsStream;

/// Marker: fallible server stream.
pub struct AsTryStream;

impl<T> IntoInvocationOutput<AsValue> for T
where
    T: Serialize + Send + 'static,
{
    const KIND: ResultKind = ResultKind::Single;

    fn into_output(self) -> InvocationOutput {
        match serde_json::to_value(self) {
            Ok(value) => InvocationOutput::Value(value),
            Err(e) => InvocationOutput::Error(format!("could not serialize result: {e}")),
        }
    }
}

impl<T> IntoInvocationOutput<AsResult> for Result<T, HubError>
where
    T: Serialize + Send + 'static,
{
    const KIND: ResultKind = ResultKind::Single;

    fn into_output(self) -> InvocationOutput {
        match self {
            Ok(value) => value.into_output(),
            Err(e) => InvocationOutput::Error(e.0),
        }
    }
}

impl<T> IntoInvocationOutput<AsStream> for ServerStream<T>
where
    T: Serialize + Send + 'static,
{
    const KIND: ResultKind = ResultKind::Streaming;

    fn into_output(self) -> InvocationOutput {
        InvocationOutput::Streaming(self.into_value_stream())
    }
}

impl<T> IntoInvocationOutput<AsTryStream> for Result<ServerStream<T>, HubError>
where
    T: Serialize + Send + 'static,
{
    const KIND: ResultKind = ResultKind::Streaming;

    fn into_output(self) -> InvocationOutput {
        match self {
            Ok(stream) => InvocationOutput::Streaming(stream.into_value_stream()),
            Err(e) => InvocationOutput::Error(e.0),
        }
    }
}

/// A registerable hub method. Implemented for async closures of arity 0–6,
/// with or without a leading [`HubContext`], over any mix of value and
/// upload-stream parameters.
pub trait HubHandler<M>: Send + Sync + 'static {
    /// The declared shape, recorded in the method descriptor.
    fn spec() -> HandlerSpec;

    /// Extract parameters and run the method.
    fn call(&self, request: InvocationRequest) -> BoxFuture<'static, InvocationOutput>;
}

macro_rules! impl_hub_handler {
    ($($marker:ident $param:ident),*) => {
        #[allow(non_snake_case, unused_mut, unused_variables)]
        impl<F, Fut, R, RM, $($marker, $param,)*> HubHandler<((), RM, $($marker, $param,)*)> for F
        where
            F: Fn($($param),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
            R: IntoInvocationOutput<RM>,
            RM: Send + Sync + 'static,
            $($param: HubParam<$marker>, $marker: Send + Sync + 'static,)*
        {
            fn spec() -> HandlerSpec {
                let stream_flags: &[bool] = &[$(<$param as HubParam<$marker>>::IS_STREAM),*];
                HandlerSpec {
                    value_params: stream_flags.iter().filter(|is_stream| !**is_stream).count(),
                    stream_params: stream_flags.iter().filter(|is_stream| **is_stream).count(),
                    takes_context: false,
                    result: <R as IntoInvocationOutput<RM>>::KIND,
                }
            }

            fn call(&self, request: InvocationRequest) -> BoxFuture<'static, InvocationOutput> {
                let mut cx = ExtractCx::new(request);
                $(
                    let $param = match <$param as HubParam<$marker>>::extract(&mut cx) {
                        Ok(value) => value,
                        Err(e) => return ready(InvocationOutput::Error(e.to_string())).boxed(),
                    };
                )*
                let future = self($($param),*);
                async move { future.await.into_output() }.boxed()
            }
        }

        #[allow(non_snake_case, unused_mut, unused_variables)]
        impl<F, Fut, R, RM, $($marker, $param,)*> HubHandler<(HubContext, RM, $($marker, $param,)*)> for F
        where
            F: Fn(HubContext, $($param),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
            R: IntoInvocationOutput<RM>,
            RM: Send + Sync + 'static,
            $($param: HubParam<$marker>, $marker: Send + Sync + 'static,)*
        {
            fn spec() -> HandlerSpec {
                let stream_flags: &[bool] = &[$(<$param as HubParam<$marker>>::IS_STREAM),*];
                HandlerSpec {
                    value_params: stream_flags.iter().filter(|is_stream| !**is_stream).count(),
                    stream_params: stream_flags.iter().filter(|is_stream| **is_stream).count(),
                    takes_context: true,
                    result: <R as IntoInvocationOutput<RM>>::KIND,
                }
            }

            fn call(&self, request: InvocationRequest) -> BoxFuture<'static, InvocationOutput> {
                let mut cx = ExtractCx::new(request);
                let context = cx.context();
                $(
                    let $param = match <$param as HubParam<$marker>>::extract(&mut cx) {
                        Ok(value) => value,
                        Err(e) => return ready(InvocationOutput::Error(e.to_string())).boxed(),
                    };
                )*
                let future = self(context, $($param),*);
                async move { future.await.into_output() }.boxed()
            }
        }
    };
}

impl_hub_handler!();
impl_hub_handler!(M1 P1);
impl_hub_handler!(M1 P1, M2 P2);
impl_hub_handler!(M1 P1, M2 P2, M3 P3);
impl_hub_handler!(M1 P1, M2 P2, M3 P3, M4 P4);
impl_hub_handler!(M1 P1, M2 P2, M3 P3, M4 P4, M5 P5);
impl_hub_handler!(M1 P1, M2 P2, M3 P3, M4 P4, M5 P5, M6 P6);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::upload_pipe;
    use crate::streams::StreamFrame;
    use serde_json::json;

    fn request(target: &str, arguments: Vec<Value>, streams: Vec<UploadSource>) -> InvocationRequest {
        InvocationRequest {
            target: target.into(),
            context: HubContext::detached("test-conn"),
            arguments,
            streams,
        }
    }

    async fn run<M, H: HubHandler<M>>(handler: H, req: InvocationRequest) -> InvocationOutput {
        handler.call(req).await
    }

    #[tokio::test]
    async fn test_value_params_decode_in_order() {
        let output = run(
            |a: i64, b: String| async move { format!("{a}-{b}") },
            request("join", vec![json!(7), json!("x")], vec![]),
        )
        .await;
        match output {
            InvocationOutput::Value(value) => assert_eq!(value, json!("7-x")),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_argument_is_reported_not_called() {
        let output = run(
            |a: i64| async move { a },
            request("inc", vec![json!("not a number")], vec![]),
        )
        .await;
        match output {
            InvocationOutput::Error(message) => {
                assert!(message.contains("argument 0"), "message: {message}");
                assert!(message.contains("inc"));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_context_and_stream_params() {
        let (tx, source) = upload_pipe(4);
        tx.send(StreamFrame::Item(json!(5))).await.unwrap();
        tx.send(StreamFrame::Completed).await.unwrap();
        drop(tx);

        let output = run(
            |ctx: HubContext, factor: i64, mut xs: UploadStream<i64>| async move {
                let mut total = 0;
                while let Some(x) = xs.recv().await {
                    total += x * factor;
                }
                format!("{}:{total}", ctx.connection_id())
            },
            request("scale", vec![json!(3)], vec![source]),
        )
        .await;
        match output {
            InvocationOutput::Value(value) => assert_eq!(value, json!("test-conn:15")),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_result_error_becomes_error_output() {
        let output = run(
            |ok: bool| async move {
                if ok {
                    Ok(json!(1))
                } else {
                    Err(HubError::new("refused"))
                }
            },
            request("gate", vec![json!(false)], vec![]),
        )
        .await;
        match output {
            InvocationOutput::Error(message) => assert_eq!(message, "refused"),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_spec_counts_streams_separately() {
        fn spec_of<M, H: HubHandler<M>>(_: &H) -> HandlerSpec {
            H::spec()
        }

        let handler = |_ctx: HubContext,
                       _factor: f64,
                       _xs: UploadStream<i64>,
                       _ys: UploadStream<f64>| async move {};
        let spec = spec_of(&handler);
        assert_eq!(spec.value_params, 1);
        assert_eq!(spec.stream_params, 2);
        assert!(spec.takes_context);
        assert_eq!(spec.result, ResultKind::Single);
    }
}
