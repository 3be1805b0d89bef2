//! # event-invoke
//!
//! Call functions across any duplex message channel.
//!
//! An [`Invoker`] sends named calls; a [`Callee`] on the other end of the
//! channel runs the matching registered [`Function`] and sends the result
//! back. The two only share a [`Channel`], which can be an in-process bus,
//! a linked pair, or a child process's stdio.
//!
//! ## Architecture
//!
//! - **Envelope**: every message is a structured value tagged with its
//!   `origin`, so a component on a shared bus drops its own traffic
//! - **Correlation**: calls are matched to responses by method name plus a
//!   per-name sequence number
//! - **Transports**: [`MemoryChannel`] in-process, [`StreamChannel`] framed
//!   MsgPack over any byte stream
//!
//! ## Example
//!
//! ```ignore
//! use event_invoke::{Callee, Function, Invoker, MemoryChannel};
//!
//! fn max(args: Vec<i64>) -> Result<Option<i64>, std::convert::Infallible> {
//!     Ok(args.into_iter().max())
//! }
//!
//! #[tokio::main]
//! async fn main() -> event_invoke::Result<()> {
//!     let bus = MemoryChannel::new();
//!     bus.connect();
//!
//!     let callee = Callee::new(bus.clone());
//!     callee.register(Function::sync(max))?;
//!     callee.listen()?;
//!
//!     let invoker = Invoker::new(bus.clone());
//!     let biggest: i64 = invoker.invoke("max", [1, 2, 3]).await?;
//!     assert_eq!(biggest, 3);
//!     Ok(())
//! }
//! ```

pub mod callee;
pub mod channel;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod invoker;
pub mod transport;

pub use callee::{Callee, CalleeOptions, Function, Registration};
pub use channel::{Channel, ChannelEvent, MemoryChannel};
pub use envelope::Envelope;
pub use error::{Result, RpcError, TransportError};
pub use invoker::{InvokeOptions, Invoker};
pub use transport::StreamChannel;
