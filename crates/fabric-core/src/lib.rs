//! Universal descriptor and invoker primitives.
//!
//! This crate holds the leaf types shared by the provider export pipeline
//! and the consumer refer pipeline: [`Url`] (the addressable descriptor and
//! cache key), [`Invocation`] and [`RpcResult`] (one call and its
//! asynchronous outcome), and the [`Invoker`] trait that both pipelines
//! build invokers against.

mod error;
mod invocation;
mod invoker;
mod result;
mod url;

pub use error::{CallError, UrlParseError};
pub use invocation::Invocation;
pub use invoker::Invoker;
pub use result::{Completer, RpcResult};
pub use url::{is_hidden_key, Url, UrlBuilder};
