//! Per-request orchestration.
//!
//! [`Pipeline`] is what the listener loops (`src/server.rs`, `src/server_tls.rs`) call for
//! every request instead of going straight to [`crate::router::Router::dispatch`]. It
//! layers, in order: static file serving (short-circuits everything else when a mount
//! matches), client IP extraction with provenance, a fresh [`crate::extractors::custom_params::CustomParams`]
//! store, the glob-scoped [`MiddlewareRegistry`] chain, the router's own matching and
//! middleware, and a deadline around the whole thing so a wedged handler can never hold
//! a connection open indefinitely. Request/response lifecycle signals are emitted on
//! [`crate::signals::EventBus`] so a metrics sink can subscribe without being threaded
//! through every call site.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use http::{StatusCode, header};
use hyper::Method;

use crate::{
  body::TakoBody,
  bridge::{BridgeOutcome, Deadline, HandlerInvoker, InvokeKind, LocalInvoker},
  extractors::{custom_params::CustomParams, ipaddr::IpAddr as ExtractedIp},
  handler::BoxHandler,
  middleware::{ChainSignal, Next},
  middleware_registry::MiddlewareRegistry,
  responder::Responder,
  route::Route,
  router::Router,
  signals::{EventBus, Signal, app_events, ids},
  static_cache::StaticCache,
  types::{BoxMiddleware, Request, Response},
};

/// Which source supplied [`ClientIp::addr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProvenance {
  /// Taken from the named forwarding header.
  Header(&'static str),
  /// No forwarding header yielded an address; fell back to the TCP peer address.
  PeerAddr,
}

/// Client address the pipeline resolved for a request, with where it came from.
///
/// Inserted into the request's extensions before the middleware registry chain runs, so
/// both middleware and the eventual handler can read it with `req.extensions().get::<ClientIp>()`
/// without re-deriving it (and without each trusting a spoofable header on its own).
#[derive(Debug, Clone)]
pub struct ClientIp {
  pub addr: std::net::IpAddr,
  pub provenance: IpProvenance,
}

impl ClientIp {
  fn resolve(req: &Request) -> Option<Self> {
    if let Some((addr, header)) = ExtractedIp::extract_with_provenance(req.headers()) {
      return Some(Self {
        addr,
        provenance: IpProvenance::Header(header),
      });
    }
    req
      .extensions()
      .get::<SocketAddr>()
      .map(|peer| Self {
        addr: peer.ip(),
        provenance: IpProvenance::PeerAddr,
      })
  }
}

/// Ties together routing, the middleware registry, static files, and the handler bridge
/// for one application.
///
/// Build one with [`Pipeline::new`], register glob-scoped middleware and bridged ids on
/// it, then hand `Arc<Pipeline>` to a listener loop in place of a bare `Arc<Router>`.
pub struct Pipeline {
  router: Arc<Router>,
  registry: MiddlewareRegistry,
  static_cache: Option<StaticCache>,
  invoker: Arc<dyn HandlerInvoker>,
  events: EventBus,
  handler_timeout: Duration,
}

impl Pipeline {
  /// Builds a pipeline around `router` with an empty middleware registry, no static
  /// mounts, the in-process [`LocalInvoker`], a 30 second handler timeout, and the
  /// global application event bus.
  pub fn new(router: Router) -> Self {
    Self {
      router: Arc::new(router),
      registry: MiddlewareRegistry::default(),
      static_cache: None,
      invoker: Arc::new(LocalInvoker::new()),
      events: app_events().clone(),
      handler_timeout: Duration::from_secs(30),
    }
  }

  pub fn with_static_cache(mut self, cache: StaticCache) -> Self {
    self.static_cache = Some(cache.with_events(self.events.clone()));
    self
  }

  pub fn with_registry(mut self, registry: MiddlewareRegistry) -> Self {
    self.registry = registry;
    self
  }

  pub fn with_invoker(mut self, invoker: Arc<dyn HandlerInvoker>) -> Self {
    self.invoker = invoker;
    self
  }

  pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
    self.handler_timeout = timeout;
    self
  }

  pub fn with_events(mut self, events: EventBus) -> Self {
    self.events = events;
    self
  }

  /// Registers a middleware bound to every path matching `pattern` (see
  /// [`MiddlewareRegistry::register`] for glob semantics).
  pub fn register_middleware(&mut self, pattern: impl Into<String>, middleware: BoxMiddleware) {
    self.registry.register(pattern, middleware);
  }

  /// Registers a middleware under `pattern` that defers to the handler bridge's `id`
  /// instead of a Rust closure, so a host binding can own the implementation.
  ///
  /// The wrapped call shares the same request-scoped deadline middleware further down
  /// the chain observes, honoring [`Pipeline::with_handler_timeout`] the same way the
  /// route handler itself does.
  pub fn register_bridged_middleware(&mut self, pattern: impl Into<String>, id: impl Into<String>) {
    let invoker = self.invoker.clone();
    let id = id.into();
    let timeout = self.handler_timeout;
    let middleware: BoxMiddleware = Arc::new(move |req, next| {
      let invoker = invoker.clone();
      let id = id.clone();
      Box::pin(async move {
        let deadline = Deadline::after(timeout);
        match invoker.invoke(InvokeKind::Middleware, &id, req, &deadline).await {
          BridgeOutcome::Continue(req) => next.run(req).await,
          BridgeOutcome::Terminated(resp) => resp,
          BridgeOutcome::TimedOut => timeout_response(),
        }
      })
    });
    self.registry.register(pattern, middleware);
  }

  /// Registers a route handler that defers to the handler bridge's `id` instead of a
  /// Rust closure, so a host binding can own the implementation.
  ///
  /// Unlike [`Pipeline::register_bridged_middleware`], which wraps a `BoxMiddleware`
  /// the registry chain calls, this registers an actual [`crate::router::Router`]
  /// route: the boxed handler it builds is what `Router::dispatch` finds and invokes
  /// when the pattern matches, so a bridged route goes through [`HandlerInvoker`] the
  /// same way a bridged middleware does rather than bypassing it.
  pub fn register_bridged_handler(
    &self,
    method: Method,
    pattern: &str,
    id: impl Into<String>,
  ) -> Arc<Route> {
    let invoker = self.invoker.clone();
    let id = id.into();
    let timeout = self.handler_timeout;
    let boxed: BoxHandler = BoxHandler::new(move |req: Request| {
      let invoker = invoker.clone();
      let id = id.clone();
      async move {
        let deadline = Deadline::after(timeout);
        match invoker.invoke(InvokeKind::Handler, &id, req, &deadline).await {
          BridgeOutcome::Terminated(resp) => resp,
          BridgeOutcome::TimedOut => timeout_response(),
          BridgeOutcome::Continue(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "bridged handler did not settle a response").into_response()
          }
        }
      }
    });

    self
      .router
      .try_route_boxed(method, pattern, boxed)
      .unwrap_or_else(|err| panic!("{err}"))
  }

  /// Serves one request through the full pipeline.
  pub async fn handle(&self, mut req: Request) -> Response {
    self.events.emit(Signal::new(ids::REQUEST_STARTED)).await;

    if let Some(cache) = &self.static_cache
      && let Some(resp) = cache.handle(&req).await
    {
      self.events.emit(Signal::new(ids::REQUEST_COMPLETED)).await;
      return resp;
    }

    if let Some(client_ip) = ClientIp::resolve(&req) {
      req.extensions_mut().insert(client_ip);
    }
    req.extensions_mut().insert(CustomParams::new());

    let path = req.uri().path().to_string();
    let registry_chain = self.registry.chain(&path);

    let router = self.router.clone();
    let dispatch: BoxHandler = BoxHandler::new(move |req: Request| {
      let router = router.clone();
      async move { router.dispatch(req).await }
    });

    let next = Next {
      middlewares: registry_chain,
      endpoint: Arc::new(dispatch),
    };

    let resp = match tokio::time::timeout(self.handler_timeout, next.run_signal(req)).await {
      Ok(ChainSignal::Continue(resp)) => resp,
      Ok(ChainSignal::Terminated(resp)) => {
        ::tracing::trace!(path = %path, "request short-circuited by middleware");
        resp
      }
      Err(_) => timeout_response(),
    };

    self.events.emit(Signal::new(ids::REQUEST_COMPLETED)).await;
    resp
  }
}

/// `408 Request Timeout` rendered when a handler doesn't settle before the pipeline's
/// deadline. Any in-flight bridged invocation is expected to have already been
/// cancelled via its `Deadline`'s token by the time this is returned.
fn timeout_response() -> Response {
  (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response()
}

/// Renders a final error as either a plain-text or JSON body depending on the request's
/// `Accept` header, for use by callers that render their own error pages ahead of the
/// pipeline (e.g. a listener's connection-level error handler).
pub fn render_error(accept: Option<&str>, status: StatusCode, message: &str) -> Response {
  let wants_json = accept.is_some_and(|accept| accept.contains("application/json"));
  if wants_json {
    let body = serde_json::json!({ "error": message, "status": status.as_u16() }).to_string();
    hyper::Response::builder()
      .status(status)
      .header(header::CONTENT_TYPE, "application/json")
      .body(TakoBody::from(body))
      .unwrap()
  } else {
    hyper::Response::builder()
      .status(status)
      .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
      .body(TakoBody::from(message.to_string()))
      .unwrap()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http_body_util::BodyExt;
  use hyper::Method;

  fn get(path: &str) -> Request {
    Request::builder()
      .method(Method::GET)
      .uri(path)
      .body(TakoBody::empty())
      .unwrap()
  }

  #[tokio::test]
  async fn routes_through_registry_and_router() {
    let mut router = Router::new();
    router.route(Method::GET, "/ping", |_req: Request| async { "pong" });

    let mut pipeline = Pipeline::new(router);
    pipeline.register_middleware(
      "*",
      Arc::new(|req, next: Next| {
        Box::pin(async move { next.run(req).await })
      }),
    );

    let resp = pipeline.handle(get("/ping")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"pong");
  }

  #[tokio::test]
  async fn unmatched_path_yields_404_through_pipeline() {
    let router = Router::new();
    let pipeline = Pipeline::new(router);
    let resp = pipeline.handle(get("/missing")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn slow_handler_hits_pipeline_timeout() {
    let mut router = Router::new();
    router.route(Method::GET, "/slow", |_req: Request| async {
      tokio::time::sleep(Duration::from_secs(10)).await;
      "too slow"
    });

    let pipeline = Pipeline::new(router).with_handler_timeout(Duration::from_millis(20));
    let resp = pipeline.handle(get("/slow")).await;
    assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
  }

  #[tokio::test]
  async fn client_ip_falls_back_to_peer_addr() {
    let mut router = Router::new();
    router.route(Method::GET, "/who", |req: Request| async move {
      let ip = req.extensions().get::<ClientIp>().cloned();
      match ip {
        Some(ClientIp { provenance: IpProvenance::PeerAddr, addr }) => addr.to_string(),
        _ => "none".to_string(),
      }
    });

    let pipeline = Pipeline::new(router);
    let mut req = get("/who");
    req.extensions_mut().insert(SocketAddr::from(([127, 0, 0, 1], 9000)));

    let resp = pipeline.handle(req).await;
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"127.0.0.1");
  }
}
