//! Handler Bridge: the boundary between the request pipeline and whatever
//! actually executes a matched handler or middleware.
//!
//! Tako is built to be embedded by a scripting host: the host registers routes and
//! middleware by an opaque id, and the pipeline must invoke *something* to settle
//! each one without knowing whether that something is a local Rust closure or an
//! FFI call into another runtime's event loop. [`HandlerInvoker`] is that
//! boundary. [`LocalInvoker`] is the default, in-process implementation (a
//! registry of boxed Rust closures); a host binding replaces it with an
//! implementation that marshals the promise-timeout wire contract described in
//! the crate's embedding documentation to its own runtime and awaits the
//! settlement without polling.
//!
//! Every invocation carries a [`Deadline`]: a point in time plus a
//! [`tokio_util::sync::CancellationToken`] that the pipeline cancels when that
//! point passes. `LocalInvoker` races the handler future against the deadline
//! with [`tokio::select!`] and discards (rather than awaits) a handler that loses
//! the race, so a slow handler can never hold a worker past the configured
//! timeout.

use std::{
  collections::HashMap,
  sync::Arc,
  time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
  responder::Responder,
  types::{Request, Response},
};

/// Which half of the pipeline is being invoked. Middleware and route handlers
/// share the same bridge contract, but a host binding may want to treat them
/// differently (e.g. route middleware failures into its own logger).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
  Middleware,
  Handler,
}

/// A deadline shared between the pipeline and a [`HandlerInvoker`].
///
/// Cloning a `Deadline` clones the `Arc`-backed token, not the instant: every
/// clone observes the same cancellation.
#[derive(Clone)]
pub struct Deadline {
  at: Instant,
  token: CancellationToken,
}

impl Deadline {
  /// Creates a deadline `timeout` from now, with a fresh cancellation token.
  pub fn after(timeout: Duration) -> Self {
    Self {
      at: Instant::now() + timeout,
      token: CancellationToken::new(),
    }
  }

  /// Time remaining until expiry, or `Duration::ZERO` if already past.
  pub fn remaining(&self) -> Duration {
    self.at.saturating_duration_since(Instant::now())
  }

  /// True once `at` has passed.
  pub fn is_expired(&self) -> bool {
    self.remaining().is_zero()
  }

  /// The cancellation token a `HandlerInvoker` should observe cooperatively and
  /// a host callback should receive as its abort signal.
  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }

  /// Fires the cancellation token. Idempotent.
  pub fn cancel(&self) {
    self.token.cancel();
  }
}

/// Outcome of one bridge invocation.
pub enum BridgeOutcome {
  /// The request continues: carries the (possibly mutated) request for the next
  /// step of the chain to consume.
  Continue(Request),
  /// The chain terminates here with this response.
  Terminated(Response),
  /// The deadline expired before the host settled. The pipeline renders this as
  /// `408`; any late completion from the host must be discarded by the invoker,
  /// not surfaced here.
  TimedOut,
}

/// Decouples the pipeline from a specific execution strategy for a registered
/// middleware or handler id.
///
/// A host binding implements this trait once and hands an `Arc<dyn
/// HandlerInvoker>` to [`crate::pipeline::Pipeline`]; everything upstream of the
/// bridge (route matching, the glob middleware registry, deadline bookkeeping)
/// stays host-agnostic.
#[async_trait]
pub trait HandlerInvoker: Send + Sync + 'static {
  /// Invokes the registered middleware or handler `id` with `req`, honoring
  /// `deadline`. Implementations MUST NOT await past `deadline.remaining()`; on
  /// expiry they should cancel any in-flight host call via `deadline.token()`
  /// and return `BridgeOutcome::TimedOut` rather than block further.
  async fn invoke(&self, kind: InvokeKind, id: &str, req: Request, deadline: &Deadline) -> BridgeOutcome;
}

/// Boxed Rust closure registered under a bridge id.
type LocalHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Default, in-process [`HandlerInvoker`]: a name -> closure registry.
///
/// This is what `Router`'s own closure-based `route`/`middleware` registration
/// compiles down to when a caller opts into bridged dispatch (see
/// [`crate::pipeline::Pipeline::with_invoker`]); embedding a foreign host means
/// swapping this out for an invoker that marshals to that host instead.
#[derive(Clone, Default)]
pub struct LocalInvoker {
  handlers: Arc<DashMap<String, LocalHandler>>,
}

impl LocalInvoker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a Rust closure under `id`, overwriting any previous registration.
  pub fn register<F, Fut, R>(&self, id: impl Into<String>, f: F)
  where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: Responder + Send + 'static,
  {
    let boxed: LocalHandler = Arc::new(move |req| {
      let fut = f(req);
      Box::pin(async move { fut.await.into_response() })
    });
    self.handlers.insert(id.into(), boxed);
  }
}

#[async_trait]
impl HandlerInvoker for LocalInvoker {
  async fn invoke(&self, _kind: InvokeKind, id: &str, req: Request, deadline: &Deadline) -> BridgeOutcome {
    let Some(handler) = self.handlers.get(id).map(|entry| entry.value().clone()) else {
      return BridgeOutcome::Terminated(
        (StatusCode::INTERNAL_SERVER_ERROR, format!("no handler registered for id {id:?}")).into_response(),
      );
    };

    let token = deadline.token();
    tokio::select! {
      biased;
      _ = token.cancelled() => BridgeOutcome::TimedOut,
      response = handler(req) => BridgeOutcome::Terminated(response),
    }
  }
}

/// Wire envelope the pipeline sends to a host for a bridged invocation: the
/// request data the host needs plus how long it has to answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeRequestEnvelope {
  pub method: String,
  pub path: String,
  pub headers: HashMap<String, Vec<String>>,
  pub query: HashMap<String, Vec<String>>,
  pub path_params: HashMap<String, String>,
  pub custom_params: HashMap<String, serde_json::Value>,
  pub body: serde_json::Value,
  #[serde(rename = "deadlineMs")]
  pub deadline_ms: u64,
}

/// Wire envelope a host returns once it settles a bridged invocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeResponseEnvelope {
  pub status: u16,
  pub content: serde_json::Value,
  #[serde(rename = "contentType", default)]
  pub content_type: Option<String>,
  #[serde(default)]
  pub headers: HashMap<String, Vec<String>>,
  #[serde(default)]
  pub cookies: Vec<String>,
  #[serde(rename = "customParams", default)]
  pub custom_params: HashMap<String, serde_json::Value>,
  #[serde(default)]
  pub error: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::body::TakoBody;

  fn get() -> Request {
    Request::builder().uri("/").body(TakoBody::empty()).unwrap()
  }

  #[tokio::test]
  async fn local_invoker_runs_registered_handler() {
    let invoker = LocalInvoker::new();
    invoker.register("hello", |_req: Request| async { "hi" });

    let deadline = Deadline::after(Duration::from_secs(5));
    match invoker.invoke(InvokeKind::Handler, "hello", get(), &deadline).await {
      BridgeOutcome::Terminated(resp) => assert_eq!(resp.status(), StatusCode::OK),
      _ => panic!("expected terminated outcome"),
    }
  }

  #[tokio::test]
  async fn missing_handler_id_yields_500() {
    let invoker = LocalInvoker::new();
    let deadline = Deadline::after(Duration::from_secs(5));
    match invoker.invoke(InvokeKind::Handler, "missing", get(), &deadline).await {
      BridgeOutcome::Terminated(resp) => assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR),
      _ => panic!("expected terminated outcome"),
    }
  }

  #[tokio::test]
  async fn expired_deadline_times_out_instead_of_awaiting() {
    let invoker = LocalInvoker::new();
    invoker.register("slow", |_req: Request| async {
      tokio::time::sleep(Duration::from_secs(10)).await;
      "too slow"
    });

    let deadline = Deadline::after(Duration::from_millis(10));
    deadline.cancel();
    match invoker.invoke(InvokeKind::Handler, "slow", get(), &deadline).await {
      BridgeOutcome::TimedOut => {}
      _ => panic!("expected timeout"),
    }
  }
}
