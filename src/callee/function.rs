//! Registered functions and their uniform call signature.
//!
//! Every function, sync or async, is stored behind [`Callable`]: a list of
//! argument values in, one future resolving to a value or a [`CallError`]
//! out. Typed adapters deserialize the argument list into the function's
//! input type and serialize its output.
//!
//! # Argument shape
//!
//! The argument list is deserialized as a JSON array, so a function takes
//! a tuple (`(a, b): (i64, i64)`) for fixed positional arguments or a
//! `Vec<_>` for variadic ones. A function taking `()` accepts an empty list.
//!
//! # Names
//!
//! A plain `fn` item carries a discoverable name: `Function::new(max)` is
//! registered as `"max"`. Closures, function pointers and generic
//! instantiations have none and must go through [`Function::named`].

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Boxed future for call results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of one call.
pub type CallResult = std::result::Result<Value, CallError>;

/// A failed call. Only the message crosses the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError(String);

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }

    pub fn into_message(self) -> String {
        self.0
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CallError {}

/// Uniform signature for everything in the registry.
pub trait Callable: Send + Sync + 'static {
    /// Run the function with the given argument list.
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, CallResult>;
}

/// Adapter for async functions with typed input and output.
pub struct AsyncFn<F, T, Fut, R, E> {
    f: F,
    _phantom: PhantomData<fn(T) -> (Fut, R, E)>,
}

impl<F, T, Fut, R, E> Callable for AsyncFn<F, T, Fut, R, E>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, CallResult> {
        let input: T = match decode_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.f)(input);
        Box::pin(async move {
            let output = fut.await.map_err(|e| CallError::new(e.to_string()))?;
            encode_output(&output)
        })
    }
}

/// Adapter for synchronous functions with typed input and output.
pub struct SyncFn<F, T, R, E> {
    f: F,
    _phantom: PhantomData<fn(T) -> (R, E)>,
}

impl<F, T, R, E> Callable for SyncFn<F, T, R, E>
where
    F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, CallResult> {
        let result = decode_args(args).and_then(|input: T| match (self.f)(input) {
            Ok(output) => encode_output(&output),
            Err(e) => Err(CallError::new(e.to_string())),
        });
        Box::pin(std::future::ready(result))
    }
}

fn decode_args<T: DeserializeOwned>(args: Vec<Value>) -> Result<T, CallError> {
    // `()` and `Option<_>` inputs take no arguments at all.
    if args.is_empty() {
        if let Ok(v) = serde_json::from_value(Value::Null) {
            return Ok(v);
        }
    }
    serde_json::from_value(Value::Array(args))
        .map_err(|e| CallError::new(format!("invalid arguments: {}", e)))
}

fn encode_output<R: Serialize>(output: &R) -> CallResult {
    serde_json::to_value(output)
        .map_err(|e| CallError::new(format!("cannot serialize result: {}", e)))
}

/// Derive a registration name from a `fn` item's type path.
fn discover_name<F>() -> Option<String> {
    let path = std::any::type_name::<F>();
    if path.contains(|c: char| matches!(c, '<' | '(' | '{' | '[' | '&' | ' ')) {
        return None;
    }

    let name = path.rsplit("::").next()?;
    let is_ident = name.chars().all(|c| c.is_alphanumeric() || c == '_')
        && name.chars().next().is_some_and(|c| !c.is_ascii_digit());

    is_ident.then(|| name.to_owned())
}

/// A callable plus the name it registers under, if it has one.
#[derive(Clone)]
pub struct Function {
    name: Option<String>,
    callable: Arc<dyn Callable>,
}

impl Function {
    /// Wrap an async `fn` item, named after the item.
    pub fn new<F, T, Fut, R, E>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = discover_name::<F>();
        Self::from_callable(
            name,
            Arc::new(AsyncFn {
                f,
                _phantom: PhantomData,
            }),
        )
    }

    /// Wrap an async function or closure under an explicit name.
    pub fn named<F, T, Fut, R, E>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self::new(f).with_name(name)
    }

    /// Wrap a synchronous `fn` item, named after the item.
    pub fn sync<F, T, R, E>(f: F) -> Self
    where
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = discover_name::<F>();
        Self::from_callable(
            name,
            Arc::new(SyncFn {
                f,
                _phantom: PhantomData,
            }),
        )
    }

    /// Wrap a synchronous function or closure under an explicit name.
    pub fn sync_named<F, T, R, E>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self::sync(f).with_name(name)
    }

    /// Use a hand-written [`Callable`].
    pub fn from_callable(name: Option<String>, callable: Arc<dyn Callable>) -> Self {
        Self { name, callable }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn callable(&self) -> &Arc<dyn Callable> {
        &self.callable
    }

    /// Call the function directly, without a channel.
    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, CallResult> {
        self.callable.call(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").field("name", &self.name).finish()
    }
}
