//! Callee - exposes local functions to a remote invoker over one channel.
//!
//! # Example
//!
//! ```ignore
//! use event_invoke::{Callee, Function, MemoryChannel};
//!
//! fn max(args: Vec<i64>) -> Result<Option<i64>, std::convert::Infallible> {
//!     Ok(args.into_iter().max())
//! }
//!
//! let bus = MemoryChannel::new();
//! let callee = Callee::new(bus.clone());
//! callee.register(Function::sync(max))?;
//! callee.listen()?;
//! ```
//!
//! Each inbound request is dispatched on its own task, so a slow function
//! never holds up replies to other requests. Those tasks belong to the
//! listener: [`Callee::destroy`] and a fatal channel error abort any that
//! have not replied yet.

mod function;
mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::channel::{Channel, ChannelEvent, Subscription};
use crate::envelope::{Envelope, Request, Response};
use crate::error::{Result, RpcError, TransportError};

pub use function::{AsyncFn, BoxFuture, CallError, CallResult, Callable, Function, SyncFn};
pub use registry::{FunctionRegistry, Registration};

/// Decides what happens to a transport error.
///
/// `Ok(())` swallows it. `Err(_)` is fatal: the callee stops listening and
/// the error comes out of [`Callee::wait_for_shutdown`].
pub type ErrorPolicy = Arc<dyn Fn(&TransportError) -> Result<()> + Send + Sync>;

/// Swallow closed-channel and broken-pipe errors, escalate the rest.
pub fn default_error_policy(error: &TransportError) -> Result<()> {
    if error.is_benign() {
        tracing::warn!(%error, "ignoring channel error");
        Ok(())
    } else {
        Err(RpcError::Transport(error.clone()))
    }
}

/// Configuration for a [`Callee`].
#[derive(Clone)]
pub struct CalleeOptions {
    on_error: ErrorPolicy,
}

impl CalleeOptions {
    /// Options with the default error policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the channel error policy.
    pub fn on_error<F>(mut self, policy: F) -> Self
    where
        F: Fn(&TransportError) -> Result<()> + Send + Sync + 'static,
    {
        self.on_error = Arc::new(policy);
        self
    }
}

impl Default for CalleeOptions {
    fn default() -> Self {
        Self {
            on_error: Arc::new(default_error_policy),
        }
    }
}

/// The side of the channel that owns functions and answers calls.
pub struct Callee {
    /// `None` once destroyed.
    channel: Mutex<Option<Arc<dyn Channel>>>,
    registry: Arc<RwLock<FunctionRegistry>>,
    listener: Mutex<Option<JoinHandle<Result<()>>>>,
    listened: AtomicBool,
    options: CalleeOptions,
}

impl Callee {
    /// Serve functions over `channel` with default options.
    ///
    /// Nothing is answered until [`listen`](Self::listen) is called.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self::with_options(channel, CalleeOptions::default())
    }

    /// Serve functions over `channel` with a custom error policy.
    pub fn with_options(channel: Arc<dyn Channel>, options: CalleeOptions) -> Self {
        Self {
            channel: Mutex::new(Some(channel)),
            registry: Arc::new(RwLock::new(FunctionRegistry::new())),
            listener: Mutex::new(None),
            listened: AtomicBool::new(false),
            options,
        }
    }

    /// Register a function, a list of functions, or a name→function map.
    ///
    /// Works before and after `listen()`.
    pub fn register(&self, entry: impl Into<Registration>) -> Result<()> {
        let count = self.registry.write().register(entry)?;
        tracing::debug!(count, "registered functions");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.read().contains(name)
    }

    /// Registered function names, sorted.
    pub fn function_names(&self) -> Vec<String> {
        self.registry.read().names()
    }

    /// Start answering requests from the channel.
    ///
    /// Must be called from inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// `AlreadyListening` on a second call, `NotConnected` after `destroy()`.
    pub fn listen(&self) -> Result<&Self> {
        let channel = self.channel.lock().clone().ok_or(RpcError::NotConnected)?;

        if self.listened.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyListening);
        }

        let events = channel.subscribe();
        let task = tokio::spawn(listen_loop(
            events,
            channel,
            self.registry.clone(),
            self.options.on_error.clone(),
        ));
        *self.listener.lock() = Some(task);

        tracing::debug!("callee listening");
        Ok(self)
    }

    /// Whether the listener is running.
    ///
    /// False before `listen()`, after `destroy()`, once the channel closed,
    /// and after a fatal channel error.
    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Wait until the listener stops.
    ///
    /// Returns `Ok(())` when the channel closes or the callee is destroyed,
    /// and the escalated error when the error policy rejected a transport
    /// error. Returns immediately if the callee is not listening.
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        let task = self.listener.lock().take();
        match task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(RpcError::Protocol(panic_message(e))),
            },
            None => Ok(()),
        }
    }

    /// Stop listening, clear the registry and tear down the channel.
    ///
    /// Requests still running are abandoned: no reply is sent for them.
    /// Calling it again is a no-op.
    pub fn destroy(&self) {
        let Some(channel) = self.channel.lock().take() else {
            return;
        };

        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        self.registry.write().clear();
        channel.destroy();

        tracing::debug!("callee destroyed");
    }
}

impl Drop for Callee {
    fn drop(&mut self) {
        if let Some(task) = self.listener.get_mut().take() {
            task.abort();
        }
    }
}

async fn listen_loop(
    mut events: Subscription,
    channel: Arc<dyn Channel>,
    registry: Arc<RwLock<FunctionRegistry>>,
    on_error: ErrorPolicy,
) -> Result<()> {
    // Dropped with the listener, which aborts every unanswered request.
    let mut answers = JoinSet::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ChannelEvent::Message(value) => {
                        let request = match Envelope::decode(value) {
                            Some(Envelope::Request(request)) => request,
                            Some(own) => {
                                tracing::trace!(origin = ?own.origin(), "dropping own message");
                                continue;
                            }
                            None => {
                                tracing::trace!("dropping malformed message");
                                continue;
                            }
                        };
                        answers.spawn(answer(request, channel.clone(), registry.clone()));
                    }
                    ChannelEvent::Error(error) => {
                        if let Err(e) = on_error(&error) {
                            tracing::error!(error = %e, "fatal channel error, callee stops listening");
                            return Err(e);
                        }
                    }
                }
            }
            Some(_) = answers.join_next(), if !answers.is_empty() => {}
        }
    }

    tracing::debug!(in_flight = answers.len(), "callee channel closed");
    while answers.join_next().await.is_some() {}
    Ok(())
}

async fn answer(request: Request, channel: Arc<dyn Channel>, registry: Arc<RwLock<FunctionRegistry>>) {
    let response = dispatch(request, &registry).await;
    let (seq, name) = (response.seq, response.name.clone());

    let sent = Envelope::from(response)
        .encode()
        .map_err(TransportError::from)
        .and_then(|value| channel.send(value));

    if let Err(error) = sent {
        tracing::warn!(seq, name = %name, %error, "failed to send response");
    }
}

/// Run one request against the registry and build its reply.
async fn dispatch(request: Request, registry: &RwLock<FunctionRegistry>) -> Response {
    let function = registry.read().get(&request.name);
    let Some(function) = function else {
        tracing::debug!(seq = request.seq, name = %request.name, "unregistered function");
        return Response::not_found(request.seq, request.name);
    };

    let seq = request.seq;
    let name = request.name.clone();
    let args = request.into_args();

    // Own task, so a panicking function turns into a FAIL reply.
    let outcome = tokio::spawn(async move { function.call(args).await }).await;

    match outcome {
        Ok(Ok(value)) => {
            tracing::debug!(seq, name = %name, "call succeeded");
            Response::ok(seq, name, value)
        }
        Ok(Err(e)) => {
            tracing::debug!(seq, name = %name, error = %e, "call failed");
            Response::fail(seq, name, e.into_message())
        }
        Err(e) => {
            let message = panic_message(e);
            tracing::warn!(seq, name = %name, %message, "call panicked");
            Response::fail(seq, name, message)
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "function was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "function panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::envelope::Status;
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use std::result::Result;

    fn foo(_: ()) -> Result<&'static str, String> {
        Ok("foo return")
    }

    fn throws(_: ()) -> Result<Value, String> {
        Err("foo throw".to_string())
    }

    async fn async_throws(_: ()) -> Result<Value, String> {
        tokio::task::yield_now().await;
        Err("async throw".to_string())
    }

    fn echo((x,): (Value,)) -> Result<Value, Infallible> {
        Ok(x)
    }

    fn request(seq: u64, name: &str, args: Value) -> Value {
        Envelope::from(Request::new(seq, name, args)).encode().unwrap()
    }

    /// Callee on one end of a pair; the test drives the other end.
    fn setup() -> (Callee, Arc<MemoryChannel>, Subscription) {
        let (near, far) = MemoryChannel::pair();
        let callee = Callee::new(far);
        let replies = near.subscribe();
        (callee, near, replies)
    }

    async fn next_response(replies: &mut Subscription) -> Response {
        match replies.recv().await {
            Some(ChannelEvent::Message(value)) => match Envelope::decode(value) {
                Some(Envelope::Response(r)) => r,
                other => panic!("expected response, got {:?}", other),
            },
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_found_reply() {
        let (callee, near, mut replies) = setup();
        callee.listen().unwrap();

        near.send(request(4, "missing", Value::Null)).unwrap();

        let response = next_response(&mut replies).await;
        assert_eq!(response.seq, 4);
        assert_eq!(response.name, "missing");
        assert_eq!(response.status, Status::NotFound);
        assert_eq!(response.payload, json!("unregistered function: \"missing\""));
    }

    #[tokio::test]
    async fn test_ok_reply() {
        let (callee, near, mut replies) = setup();
        callee.register(Function::sync(foo)).unwrap();
        callee.listen().unwrap();

        near.send(request(0, "foo", Value::Null)).unwrap();

        let response = next_response(&mut replies).await;
        assert_eq!(response, Response::ok(0, "foo", json!("foo return")));
    }

    #[tokio::test]
    async fn test_fail_reply_sync_and_async() {
        let (callee, near, mut replies) = setup();
        callee
            .register(vec![Function::sync(throws), Function::new(async_throws)])
            .unwrap();
        callee.listen().unwrap();

        near.send(request(0, "throws", Value::Null)).unwrap();
        let response = next_response(&mut replies).await;
        assert_eq!(response, Response::fail(0, "throws", "foo throw"));

        near.send(request(0, "async_throws", Value::Null)).unwrap();
        let response = next_response(&mut replies).await;
        assert_eq!(response, Response::fail(0, "async_throws", "async throw"));
    }

    #[tokio::test]
    async fn test_panicking_function_replies_fail() {
        let (callee, near, mut replies) = setup();
        callee
            .register(Function::sync_named("explode", |_: ()| -> Result<Value, String> {
                panic!("kaboom")
            }))
            .unwrap();
        callee.listen().unwrap();

        near.send(request(1, "explode", Value::Null)).unwrap();

        let response = next_response(&mut replies).await;
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.payload, json!("kaboom"));
    }

    #[tokio::test]
    async fn test_single_argument_is_coerced() {
        let (callee, near, mut replies) = setup();
        callee.register(Function::sync(echo)).unwrap();
        callee.listen().unwrap();

        near.send(request(0, "echo", json!({"k": [1, 2]}))).unwrap();

        let response = next_response(&mut replies).await;
        assert_eq!(response.payload, json!({"k": [1, 2]}));
    }

    #[tokio::test]
    async fn test_malformed_and_own_origin_dropped() {
        let (callee, near, mut replies) = setup();
        callee.register(Function::sync(foo)).unwrap();
        callee.listen().unwrap();

        near.send(Value::Null).unwrap();
        near.send(json!("garbage")).unwrap();
        near.send(json!({"name": "foo"})).unwrap();
        near.send(Envelope::from(Response::ok(0, "foo", json!(1))).encode().unwrap())
            .unwrap();
        near.send(request(9, "foo", Value::Null)).unwrap();

        let response = next_response(&mut replies).await;
        assert_eq!(response.seq, 9);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), replies.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let (callee, _near, _replies) = setup();
        callee.listen().unwrap();
        assert!(matches!(callee.listen(), Err(RpcError::AlreadyListening)));
    }

    #[tokio::test]
    async fn test_listen_is_chainable() {
        let (callee, _near, _replies) = setup();
        assert!(callee.listen().unwrap().is_listening());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (near, far) = MemoryChannel::pair();
        let callee = Callee::new(far.clone());
        callee.register(Function::sync(foo)).unwrap();
        callee.listen().unwrap();

        callee.destroy();
        callee.destroy();

        assert!(!callee.is_registered("foo"));
        assert!(!far.is_connected());
        assert_eq!(far.subscriber_count(), 0);
        assert!(matches!(callee.listen(), Err(RpcError::NotConnected)));
        drop(near);
    }

    #[tokio::test]
    async fn test_default_policy_swallows_closed_channel() {
        let (near, far) = MemoryChannel::pair();
        let mut replies = near.subscribe();
        let callee = Callee::new(far.clone());
        callee.register(Function::sync(foo)).unwrap();
        callee.listen().unwrap();

        far.emit_error(TransportError::ChannelClosed);
        far.emit_error(TransportError::BrokenPipe);
        near.send(request(0, "foo", Value::Null)).unwrap();

        // Still answering after both errors
        assert_eq!(next_response(&mut replies).await.status, Status::Ok);
        assert!(callee.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_abandons_running_requests() {
        let (callee, near, mut replies) = setup();
        callee
            .register(Function::named("slow", |_: ()| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>("late")
            }))
            .unwrap();
        callee.listen().unwrap();

        near.send(request(0, "slow", Value::Null)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        callee.destroy();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_close_waits_for_running_requests() {
        let (near, far) = MemoryChannel::pair();
        let mut replies = near.subscribe();
        let callee = Callee::new(far.clone());
        callee
            .register(Function::named("slow", |_: ()| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>("done")
            }))
            .unwrap();
        callee.listen().unwrap();

        near.send(request(0, "slow", Value::Null)).unwrap();
        // Ends the callee's inbound stream without touching the callee.
        far.destroy();

        assert_eq!(next_response(&mut replies).await.payload, json!("done"));
        assert!(callee.wait_for_shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_default_policy_escalates_other_errors() {
        let (_near, far) = MemoryChannel::pair();
        let callee = Callee::new(far.clone());
        callee.listen().unwrap();

        far.emit_error(TransportError::Codec("corrupt".into()));

        let result = callee.wait_for_shutdown().await;
        assert!(matches!(
            result,
            Err(RpcError::Transport(TransportError::Codec(_)))
        ));
    }

    #[tokio::test]
    async fn test_custom_error_policy() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let options = CalleeOptions::new().on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (_near, far) = MemoryChannel::pair();
        let callee = Callee::with_options(far.clone(), options);
        callee.listen().unwrap();

        far.emit_error(TransportError::Codec("ignored".into()));
        far.emit_error(TransportError::Protocol("ignored".into()));
        far.destroy();

        assert!(callee.wait_for_shutdown().await.is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_register_after_listen() {
        let (callee, near, mut replies) = setup();
        callee.listen().unwrap();
        callee.register(Function::sync(foo)).unwrap();

        near.send(request(0, "foo", Value::Null)).unwrap();
        assert_eq!(next_response(&mut replies).await.status, Status::Ok);
    }

    #[test]
    fn test_invalid_registration_surfaces() {
        let (_near, far) = MemoryChannel::pair();
        let callee = Callee::new(far);
        let result = callee.register(Function::sync(|_: ()| Ok::<_, String>(1)));
        assert!(matches!(result, Err(RpcError::InvalidRegistration(_))));
        assert!(callee.function_names().is_empty());
    }
}
