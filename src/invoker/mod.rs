//! Invoker - calls functions registered on a remote [`Callee`](crate::Callee).
//!
//! # Example
//!
//! ```ignore
//! use event_invoke::{Invoker, MemoryChannel};
//!
//! let bus = MemoryChannel::new();
//! bus.connect();
//!
//! let invoker = Invoker::new(bus.clone());
//! let biggest: i64 = invoker.invoke("max", [1, 2, 3]).await?;
//! ```
//!
//! Calls are correlated by `(name, seq)`. Any number of calls may be
//! outstanding at once, to the same or different names; each settles
//! exactly once, by response, timeout or [`Invoker::destroy`].

mod options;
mod pending;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelEvent, Subscription};
use crate::envelope::{Envelope, Request};
use crate::error::{Result, RpcError};
use crate::transport;

pub use options::{InvokeOptions, DEFAULT_TIMEOUT};
use pending::PendingTable;

type SharedTable = Arc<Mutex<PendingTable>>;

/// The calling side of a channel.
pub struct Invoker {
    channel: Arc<dyn Channel>,
    pending: SharedTable,
    options: InvokeOptions,
    destroyed: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Invoker {
    /// Attach to `channel` with the default 3000 ms timeout.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self::with_options(channel, InvokeOptions::default())
    }

    /// Attach to `channel`; `options` apply to every call made with
    /// [`invoke`](Self::invoke).
    pub fn with_options(channel: Arc<dyn Channel>, options: InvokeOptions) -> Self {
        let pending = SharedTable::default();
        let events = channel.subscribe();
        let listener = tokio::spawn(listen_loop(events, pending.clone()));

        Self {
            channel,
            pending,
            options,
            destroyed: AtomicBool::new(false),
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Spawn `command` as a child process and attach to its stdio.
    ///
    /// The child must serve a [`Callee`](crate::Callee) over
    /// [`StreamChannel::stdio`](crate::StreamChannel::stdio).
    pub fn fork(command: &mut Command) -> Result<(Self, Child)> {
        let (channel, child) = transport::fork(command)?;
        Ok((Self::new(channel), child))
    }

    /// Call `name` with the invoker's default options.
    ///
    /// `args` is serialized to JSON: a sequence becomes the argument list,
    /// `()` means no arguments and any other value is a single argument.
    ///
    /// # Errors
    ///
    /// - `InvalidMethodName` for an empty name, before anything is sent
    /// - `NotConnected` when the channel is down or the invoker destroyed
    /// - `UnregisteredFunction` / `RemoteInvocationFailure` from the callee
    /// - `Timeout` when no response arrives in time
    /// - `DestroyedWhilePending` when `destroy()` runs first
    /// - `Json` when the result does not deserialize into `R`
    pub async fn invoke<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.invoke_with(name, args, self.options).await
    }

    /// Call `name` with per-call options.
    pub async fn invoke_with<A, R>(&self, name: &str, args: A, options: InvokeOptions) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if name.is_empty() {
            return Err(RpcError::InvalidMethodName);
        }
        if self.destroyed.load(Ordering::Acquire) || !self.channel.is_connected() {
            return Err(RpcError::NotConnected);
        }

        let args = serde_json::to_value(args)?;
        let value = self.call(name, args, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call(&self, name: &str, args: Value, options: InvokeOptions) -> Result<Value> {
        let (tx, rx) = oneshot::channel();

        // `destroy()` closes the table under the same lock.
        let (seq, id) = self
            .pending
            .lock()
            .insert(name, tx, |seq, id| {
                options.has_timeout().then(|| {
                    spawn_timer(self.pending.clone(), name.to_owned(), seq, id, options.timeout)
                })
            })
            .ok_or(RpcError::NotConnected)?;

        let mut guard = CallGuard {
            pending: &self.pending,
            name,
            seq,
            id,
            armed: true,
        };

        let sent = Envelope::from(Request::new(seq, name, args))
            .encode()
            .and_then(|value| self.channel.send(value).map_err(RpcError::from));

        if let Err(e) = sent {
            tracing::debug!(seq, name, error = %e, "failed to send request");
            return Err(e);
        }

        tracing::trace!(seq, name, "request sent");

        let result = rx.await;
        guard.armed = false;

        match result {
            Ok(result) => result,
            // Only `destroy()` drops a reply sender unanswered.
            Err(_) => Err(RpcError::DestroyedWhilePending {
                name: name.to_owned(),
            }),
        }
    }

    /// Number of calls still waiting for a result.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Options applied by [`invoke`](Self::invoke).
    pub fn options(&self) -> InvokeOptions {
        self.options
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Reject every pending call, stop listening and disconnect the channel.
    ///
    /// Calling it again is a no-op.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained = self.pending.lock().close();
        let rejected = drained.len();
        for (name, _, call) in drained {
            call.settle(Err(RpcError::DestroyedWhilePending { name }));
        }

        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        if self.channel.is_connected() {
            self.channel.disconnect();
        }

        tracing::debug!(rejected, "invoker destroyed");
    }
}

impl Drop for Invoker {
    fn drop(&mut self) {
        if let Some(task) = self.listener.get_mut().take() {
            task.abort();
        }
    }
}

/// Removes a call from the table when its `invoke` future is dropped
/// before the call settled.
struct CallGuard<'a> {
    pending: &'a SharedTable,
    name: &'a str,
    seq: u64,
    id: u64,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let call = self.pending.lock().take_id(self.name, self.seq, self.id);
        if let Some(call) = call {
            tracing::trace!(seq = self.seq, name = self.name, "abandoned call removed");
            call.discard();
        }
    }
}

fn spawn_timer(pending: SharedTable, name: String, seq: u64, id: u64, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        let call = pending.lock().take_id(&name, seq, id);
        if let Some(call) = call {
            tracing::debug!(seq, name = %name, "call timed out");
            call.expire(Err(RpcError::Timeout { name, timeout }));
        }
    })
}

async fn listen_loop(mut events: Subscription, pending: SharedTable) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(value) => {
                let response = match Envelope::decode(value) {
                    Some(Envelope::Response(response)) => response,
                    Some(own) => {
                        tracing::trace!(origin = ?own.origin(), "dropping own message");
                        continue;
                    }
                    None => {
                        tracing::trace!("dropping malformed message");
                        continue;
                    }
                };

                let call = pending.lock().take(&response.name, response.seq);
                match call {
                    Some(call) => {
                        tracing::debug!(seq = response.seq, name = %response.name, status = ?response.status, "settling call");
                        call.settle(response.into_result());
                    }
                    None => {
                        tracing::trace!(seq = response.seq, name = %response.name, "no pending call for response");
                    }
                }
            }
            ChannelEvent::Error(error) => {
                tracing::warn!(%error, "invoker channel error");
            }
        }
    }

    tracing::debug!("invoker channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::envelope::Response;
    use crate::error::TransportError;
    use serde_json::json;

    /// Invoker on one end of a pair; the test plays the callee on the other.
    fn setup() -> (Arc<Invoker>, Arc<MemoryChannel>, Subscription) {
        let (near, far) = MemoryChannel::pair();
        let requests = far.subscribe();
        let invoker = Arc::new(Invoker::new(near));
        (invoker, far, requests)
    }

    async fn next_request(requests: &mut Subscription) -> Request {
        match requests.recv().await {
            Some(ChannelEvent::Message(value)) => match Envelope::decode(value) {
                Some(Envelope::Request(r)) => r,
                other => panic!("expected request, got {:?}", other),
            },
            other => panic!("expected message, got {:?}", other),
        }
    }

    fn reply(far: &MemoryChannel, response: Response) {
        far.send(Envelope::from(response).encode().unwrap()).unwrap();
    }

    fn spawn_invoke(invoker: &Arc<Invoker>, name: &'static str, args: Value) -> JoinHandle<Result<Value>> {
        let invoker = invoker.clone();
        tokio::spawn(async move { invoker.invoke(name, args).await })
    }

    /// Rejects every send.
    struct ClosedChannel;

    impl Channel for ClosedChannel {
        fn send(&self, _message: Value) -> std::result::Result<(), TransportError> {
            Err(TransportError::ChannelClosed)
        }

        fn subscribe(&self) -> Subscription {
            tokio::sync::mpsc::unbounded_channel().1
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn connect(&self) {}

        fn disconnect(&self) {}
    }

    #[tokio::test]
    async fn test_response_settles_call() {
        let (invoker, far, mut requests) = setup();
        let call = spawn_invoke(&invoker, "max", json!([1, 2, 3]));

        let request = next_request(&mut requests).await;
        assert_eq!(request, Request::new(0, "max", json!([1, 2, 3])));

        reply(&far, Response::ok(0, "max", json!(3)));
        assert_eq!(call.await.unwrap().unwrap(), json!(3));
        assert_eq!(invoker.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_seq_allocated_per_name() {
        let (invoker, far, mut requests) = setup();
        let first = spawn_invoke(&invoker, "max", json!([1]));
        let r0 = next_request(&mut requests).await;
        let second = spawn_invoke(&invoker, "max", json!([2]));
        let r1 = next_request(&mut requests).await;
        let other = spawn_invoke(&invoker, "sleep", json!(10));
        let r2 = next_request(&mut requests).await;

        assert_eq!((r0.seq, r1.seq, r2.seq), (0, 1, 0));
        assert_eq!(invoker.pending_calls(), 3);

        // Out of order on purpose.
        reply(&far, Response::ok(1, "max", json!("second")));
        reply(&far, Response::ok(0, "sleep", json!("other")));
        reply(&far, Response::ok(0, "max", json!("first")));

        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
        assert_eq!(other.await.unwrap().unwrap(), json!("other"));
    }

    #[tokio::test]
    async fn test_seq_is_max_outstanding_plus_one() {
        let (invoker, far, mut requests) = setup();
        let first = spawn_invoke(&invoker, "foo", Value::Null);
        next_request(&mut requests).await;
        let _second = spawn_invoke(&invoker, "foo", Value::Null);
        next_request(&mut requests).await;

        reply(&far, Response::ok(0, "foo", Value::Null));
        first.await.unwrap().unwrap();

        let _third = spawn_invoke(&invoker, "foo", Value::Null);
        assert_eq!(next_request(&mut requests).await.seq, 2);
    }

    #[tokio::test]
    async fn test_remote_errors_surface() {
        let (invoker, far, mut requests) = setup();

        let call = spawn_invoke(&invoker, "missing", Value::Null);
        next_request(&mut requests).await;
        reply(&far, Response::not_found(0, "missing"));
        match call.await.unwrap() {
            Err(RpcError::UnregisteredFunction(message)) => assert!(message.contains("missing")),
            other => panic!("unexpected {:?}", other),
        }

        let call = spawn_invoke(&invoker, "throws", Value::Null);
        next_request(&mut requests).await;
        reply(&far, Response::fail(0, "throws", "foo throw"));
        match call.await.unwrap() {
            Err(RpcError::RemoteInvocationFailure(message)) => assert_eq!(message, "foo throw"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_and_own_messages_ignored() {
        let (invoker, far, mut requests) = setup();
        let call = spawn_invoke(&invoker, "foo", Value::Null);
        next_request(&mut requests).await;

        far.send(json!("garbage")).unwrap();
        far.send(Envelope::from(Request::new(0, "foo", Value::Null)).encode().unwrap())
            .unwrap();
        reply(&far, Response::ok(7, "foo", json!("wrong seq")));
        reply(&far, Response::ok(0, "bar", json!("wrong name")));
        reply(&far, Response::ok(0, "foo", json!("right")));

        assert_eq!(call.await.unwrap().unwrap(), json!("right"));
    }

    #[tokio::test]
    async fn test_result_type_mismatch() {
        let (invoker, far, mut requests) = setup();
        let handle = {
            let invoker = invoker.clone();
            tokio::spawn(async move { invoker.invoke::<_, i64>("foo", ()).await })
        };
        next_request(&mut requests).await;
        reply(&far, Response::ok(0, "foo", json!("not a number")));

        assert!(matches!(handle.await.unwrap(), Err(RpcError::Json(_))));
    }

    #[tokio::test]
    async fn test_invalid_method_name() {
        let (invoker, _far, mut requests) = setup();
        let result = invoker.invoke::<_, Value>("", ()).await;

        assert!(matches!(result, Err(RpcError::InvalidMethodName)));
        assert!(requests.try_recv().is_err());
        assert_eq!(invoker.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let bus = MemoryChannel::new();
        let mut seen = bus.subscribe();
        let invoker = Invoker::new(bus.clone());

        let result = invoker.invoke::<_, Value>("foo", ()).await;
        assert!(matches!(result, Err(RpcError::NotConnected)));
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_failure_leaves_nothing_pending() {
        let invoker = Invoker::new(Arc::new(ClosedChannel));
        let result = invoker.invoke::<_, Value>("foo", ()).await;

        assert!(matches!(
            result,
            Err(RpcError::Transport(TransportError::ChannelClosed))
        ));
        assert_eq!(invoker.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline() {
        let (near, _far) = MemoryChannel::pair();
        let invoker = Arc::new(Invoker::with_options(near, InvokeOptions::from_millis(100)));
        let call = spawn_invoke(&invoker, "sleep", json!(1000));

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(!call.is_finished());
        assert_eq!(invoker.pending_calls(), 1);

        match call.await.unwrap() {
            Err(RpcError::Timeout { name, timeout }) => {
                assert_eq!(name, "sleep");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(invoker.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_timeout_overrides_default() {
        let (invoker, _far, _requests) = setup();
        let result = invoker
            .invoke_with::<_, Value>("sleep", (), InvokeOptions::from_millis(10))
            .await;

        assert!(matches!(result, Err(RpcError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_waits_forever() {
        let (near, far) = MemoryChannel::pair();
        let mut requests = far.subscribe();
        let invoker = Arc::new(Invoker::with_options(near, InvokeOptions::no_timeout()));
        let call = spawn_invoke(&invoker, "slow", Value::Null);
        next_request(&mut requests).await;

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!call.is_finished());

        reply(&far, Response::ok(0, "slow", json!("finally")));
        assert_eq!(call.await.unwrap().unwrap(), json!("finally"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_leaves_nothing_pending() {
        let (near, far) = MemoryChannel::pair();
        let mut requests = far.subscribe();
        let invoker = Invoker::with_options(near, InvokeOptions::no_timeout());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            invoker.invoke::<_, Value>("foo", ()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(next_request(&mut requests).await.seq, 0);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(invoker.pending_calls(), 0);

        // The next call starts numbering over instead of skipping past it.
        let invoker = Arc::new(invoker);
        let _next = spawn_invoke(&invoker, "foo", Value::Null);
        assert_eq!(next_request(&mut requests).await.seq, 0);
        assert_eq!(invoker.pending_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_call_cancels_its_timer() {
        let (invoker, far, mut requests) = setup();

        let call = spawn_invoke(&invoker, "foo", Value::Null);
        next_request(&mut requests).await;
        reply(&far, Response::ok(0, "foo", json!(1)));
        call.await.unwrap().unwrap();

        // Reuses seq 0, with no timer of its own.
        let second = {
            let invoker = invoker.clone();
            tokio::spawn(async move {
                invoker
                    .invoke_with::<_, Value>("foo", (), InvokeOptions::no_timeout())
                    .await
            })
        };
        assert_eq!(next_request(&mut requests).await.seq, 0);

        tokio::time::sleep(DEFAULT_TIMEOUT * 2).await;
        assert!(!second.is_finished());
        assert_eq!(invoker.pending_calls(), 1);
    }

    #[tokio::test]
    async fn test_destroy_rejects_pending_calls() {
        let (near, far) = MemoryChannel::pair();
        let mut requests = far.subscribe();
        let invoker = Arc::new(Invoker::new(near.clone()));

        let calls: Vec<_> = (0..3)
            .map(|_| spawn_invoke(&invoker, "sleep", json!(1000)))
            .collect();
        for _ in 0..3 {
            next_request(&mut requests).await;
        }

        invoker.destroy();
        invoker.destroy();

        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(RpcError::DestroyedWhilePending { .. })
            ));
        }
        assert!(invoker.is_destroyed());
        assert!(!near.is_connected());
        assert_eq!(invoker.pending_calls(), 0);

        // A late response has nowhere to go.
        reply(&far, Response::ok(0, "sleep", Value::Null));

        let result = invoker.invoke::<_, Value>("sleep", ()).await;
        assert!(matches!(result, Err(RpcError::NotConnected)));
    }

    #[tokio::test]
    async fn test_call_racing_destroy_is_refused() {
        let (invoker, _far, mut requests) = setup();
        invoker.destroy();

        // Past the up-front checks, as if destroy() ran right after them.
        let result = invoker
            .call("foo", Value::Null, InvokeOptions::no_timeout())
            .await;

        assert!(matches!(result, Err(RpcError::NotConnected)));
        assert_eq!(invoker.pending_calls(), 0);
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_status_rejects() {
        let (invoker, far, mut requests) = setup();

        for status in [json!(300), json!(-1)] {
            let call = spawn_invoke(&invoker, "foo", Value::Null);
            assert_eq!(next_request(&mut requests).await.seq, 0);
            far.send(json!({
                "origin": "callee",
                "seq": 0,
                "name": "foo",
                "status": status,
                "payload": "bad",
            }))
            .unwrap();

            match call.await.unwrap() {
                Err(RpcError::RemoteInvocationFailure(message)) => assert_eq!(message, "bad"),
                other => panic!("status {}: unexpected {:?}", status, other),
            }
        }
    }

    #[tokio::test]
    async fn test_fork_missing_binary() {
        let result = Invoker::fork(&mut Command::new("event-invoke-no-such-binary"));
        assert!(matches!(result, Err(RpcError::Io(_))));
    }
}
