//! HTTP request routing and dispatch functionality.
//!
//! This module provides the core `Router` struct that manages HTTP routes, middleware
//! chains, and request dispatching. Path matching is delegated to a [`matchit::Router`]
//! trie (literal segments, `{name}` captures, and `{*rest}` catch-alls), which replaces
//! the linear route scan the teacher implementation used. Each trie node holds one
//! [`crate::route::Route`] per HTTP method plus an optional `ANY` fallback, so multiple
//! methods can share a pattern without registering it twice.
//!
//! # Examples
//!
//! ```rust
//! use tako::{router::Router, Method, responder::Responder, types::Request};
//!
//! async fn hello(_req: Request) -> impl Responder {
//!     "Hello, World!"
//! }
//!
//! async fn user_handler(_req: Request) -> impl Responder {
//!     "User profile"
//! }
//!
//! let mut router = Router::new();
//! router.route(Method::GET, "/", hello);
//! router.route(Method::GET, "/users/{id}", user_handler);
//!
//! // Add global middleware
//! router.middleware(|req, next| async move {
//!     println!("Processing request to: {}", req.uri());
//!     next.run(req).await
//! });
//! ```

use std::sync::{Arc, OnceLock, RwLock};

use http::StatusCode;
use hyper::Method;

use crate::{
    body::TakoBody,
    extractors::params::PathParams,
    handler::{BoxHandler, Handler},
    middleware::Next,
    responder::Responder,
    route::{MatchOutcome, Route, RouteError, RouteNode},
    types::{BoxMiddleware, Request, Response},
};

#[cfg(feature = "plugins")]
use crate::plugins::TakoPlugin;

#[cfg(feature = "plugins")]
use std::sync::atomic::AtomicBool;

/// Pseudo-method used to register a handler for every HTTP method at a given path.
///
/// An `ANY` route is only consulted as a fallback: it answers a request whose method
/// didn't match any *other* pattern at all, not merely the same pattern (a `GET`
/// fallback never shadows a more specific `POST` registered at the same path).
fn any_method() -> Method {
    static ANY: OnceLock<Method> = OnceLock::new();
    ANY.get_or_init(|| Method::from_bytes(b"ANY").expect("ANY is a valid HTTP token"))
}

/// HTTP router for managing routes, middleware, and request dispatching.
///
/// The `Router` is the central component for routing HTTP requests to appropriate
/// handlers. It supports dynamic path parameters, middleware chains, plugin integration,
/// and an `ANY`-method fallback. Routes are matched using a trie (via `matchit`) keyed by
/// path pattern; a distinct [`crate::route::RouteNode`] at each pattern stores one route
/// per method.
///
/// # Examples
///
/// ```rust
/// use tako::{router::Router, Method, responder::Responder, types::Request};
///
/// async fn index(_req: Request) -> impl Responder {
///     "Welcome to the home page!"
/// }
///
/// async fn user_profile(_req: Request) -> impl Responder {
///     "User profile page"
/// }
///
/// let mut router = Router::new();
/// router.route(Method::GET, "/", index);
/// router.route(Method::GET, "/users/{id}", user_profile);
/// ```
pub struct Router {
    /// Trie mapping path patterns to their per-method route node, used for matching
    /// concrete request paths.
    matcher: RwLock<matchit::Router<Arc<RouteNode>>>,
    /// Pattern string -> node, used to make registration idempotent: `matchit::Router::at`
    /// matches literal request paths against patterns, it cannot be used to look up an
    /// already-registered pattern string (which may itself contain `{`/`}`), so the
    /// pattern's node is also kept here for direct lookup on repeat registration.
    nodes: RwLock<std::collections::HashMap<String, Arc<RouteNode>>>,
    /// Global middleware chain applied to all routes.
    middlewares: RwLock<Vec<BoxMiddleware>>,
    /// Registered plugins for extending functionality.
    #[cfg(feature = "plugins")]
    plugins: Vec<Box<dyn TakoPlugin>>,
    /// Flag to ensure plugins are initialized only once.
    #[cfg(feature = "plugins")]
    plugins_initialized: AtomicBool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates a new, empty router.
    pub fn new() -> Self {
        Self {
            matcher: RwLock::new(matchit::Router::new()),
            nodes: RwLock::new(std::collections::HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
            #[cfg(feature = "plugins")]
            plugins: Vec::new(),
            #[cfg(feature = "plugins")]
            plugins_initialized: AtomicBool::new(false),
        }
    }

    /// Looks up (or lazily creates) the trie node for a path pattern.
    fn node_for(&self, path: &str) -> Result<Arc<RouteNode>, RouteError> {
        if let Some(node) = self.nodes.read().unwrap().get(path) {
            return Ok(node.clone());
        }

        let node = Arc::new(RouteNode::default());
        self.matcher
            .write()
            .unwrap()
            .insert(path, node.clone())
            .map_err(|e| RouteError::InvalidPattern {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        self.nodes
            .write()
            .unwrap()
            .insert(path.to_string(), node.clone());
        Ok(node)
    }

    /// Registers a route, returning the duplicate-registration error instead of
    /// silently overwriting an existing method/path combination.
    fn try_insert(&self, route: Arc<Route>) -> Result<(), RouteError> {
        let node = self.node_for(&route.path)?;
        let is_any = route.method == any_method();
        node.insert(route, is_any)
    }

    /// Registers a new route with the router.
    ///
    /// Associates an HTTP method and path pattern with a handler function. The path
    /// can contain dynamic segments using curly braces (e.g., `/users/{id}`) and a
    /// single trailing catch-all segment (e.g., `/files/{*rest}`), which are extracted
    /// as parameters during request processing.
    ///
    /// # Panics
    ///
    /// Panics if the method/path combination is already registered, or the pattern is
    /// malformed (conflicting wildcard placement). Use [`Router::try_route`] to handle
    /// either case without panicking.
    pub fn route<H, T>(&mut self, method: Method, path: &str, handler: H) -> Arc<Route>
    where
        H: Handler<T> + Clone + 'static,
    {
        self.try_route(method, path, handler)
            .unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible counterpart to [`Router::route`].
    pub fn try_route<H, T>(
        &mut self,
        method: Method,
        path: &str,
        handler: H,
    ) -> Result<Arc<Route>, RouteError>
    where
        H: Handler<T> + Clone + 'static,
    {
        let route = Arc::new(Route::new(
            path.to_string(),
            method,
            BoxHandler::new(handler),
            None,
        ));
        self.try_insert(route.clone())?;
        Ok(route)
    }

    /// Registers an already-boxed handler, bypassing [`Handler`]'s generic bound.
    ///
    /// Takes `&self` rather than `&mut self`: [`Pipeline::register_bridged_handler`]
    /// only holds an `Arc<Router>`, and registration itself is already safe to call
    /// concurrently since every field it touches is lock-protected internally.
    pub(crate) fn try_route_boxed(
        &self,
        method: Method,
        path: &str,
        handler: BoxHandler,
    ) -> Result<Arc<Route>, RouteError> {
        let route = Arc::new(Route::new(path.to_string(), method, handler, None));
        self.try_insert(route.clone())?;
        Ok(route)
    }

    /// Registers a handler for every HTTP method at `path`, consulted only when no
    /// method-specific route matches the path at all.
    pub fn route_any<H, T>(&mut self, path: &str, handler: H) -> Arc<Route>
    where
        H: Handler<T> + Clone + 'static,
    {
        let route = Arc::new(Route::new(
            path.to_string(),
            any_method(),
            BoxHandler::new(handler),
            None,
        ));
        self.try_insert(route.clone())
            .unwrap_or_else(|err| panic!("{err}"));
        route
    }

    /// Registers a route with trailing slash redirection enabled.
    ///
    /// When TSR is enabled, requests to paths with or without trailing slashes
    /// are automatically redirected to the canonical version.
    ///
    /// # Panics
    ///
    /// Panics if called with the root path ("/") since TSR is not applicable, or if the
    /// method/path combination is already registered.
    pub fn route_with_tsr<H, T>(&mut self, method: Method, path: &str, handler: H) -> Arc<Route>
    where
        H: Handler<T> + Clone + 'static,
    {
        if path == "/" {
            panic!("Cannot route with TSR for root path");
        }

        let route = Arc::new(Route::new(
            path.to_string(),
            method,
            BoxHandler::new(handler),
            Some(true),
        ));
        self.try_insert(route.clone())
            .unwrap_or_else(|err| panic!("{err}"));
        route
    }

    /// Matches a method and path against the route table without executing anything.
    ///
    /// Returns [`MatchOutcome::MethodNotAllowed`] (carrying the `Allow`-header method
    /// list) when the path matched some pattern but not for this method, distinguishing
    /// that case from a genuine 404.
    pub fn match_request(&self, method: &Method, path: &str) -> MatchOutcome {
        let matcher = self.matcher.read().unwrap();
        let found = match matcher.at(path) {
            Ok(m) => m,
            Err(_) => return MatchOutcome::NotFound,
        };

        if let Some(route) = found.value.get(method) {
            let params = found
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), decode_param(v)))
                .collect();
            return MatchOutcome::Matched { route, params };
        }

        let allowed = found.value.allowed_methods();
        if allowed.is_empty() {
            MatchOutcome::NotFound
        } else {
            MatchOutcome::MethodNotAllowed(allowed)
        }
    }

    /// Dispatches an incoming request to the appropriate route handler.
    ///
    /// Performs route matching based on HTTP method and path, extracts path parameters,
    /// and executes the handler through the middleware chain. A path that matches some
    /// pattern but not this method yields `405 Method Not Allowed` with an `Allow`
    /// header; trailing-slash redirection is attempted before falling back to `404`.
    pub async fn dispatch(&self, mut req: Request) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.match_request(&method, &path) {
            MatchOutcome::Matched { route, params } => {
                if !params.is_empty() {
                    req.extensions_mut().insert(PathParams(params));
                }

                let g_mws = self.middlewares.read().unwrap().clone();
                let r_mws = route.middlewares.read().unwrap().clone();
                let mut chain = Vec::with_capacity(g_mws.len() + r_mws.len());
                chain.extend(g_mws);
                chain.extend(r_mws);

                let next = Next {
                    middlewares: Arc::new(chain),
                    endpoint: Arc::new(route.handler.clone()),
                };
                next.run(req).await
            }
            MatchOutcome::MethodNotAllowed(allowed) => {
                method_not_allowed_response(&allowed)
            }
            MatchOutcome::NotFound => {
                if let Some(redirect) = self.trailing_slash_redirect(&method, &path) {
                    return redirect;
                }

                hyper::Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(TakoBody::empty())
                    .unwrap()
            }
        }
    }

    fn trailing_slash_redirect(&self, method: &Method, path: &str) -> Option<Response> {
        let tsr_path = if let Some(stripped) = path.strip_suffix('/') {
            stripped.to_string()
        } else {
            format!("{path}/")
        };

        let matcher = self.matcher.read().unwrap();
        let found = matcher.at(&tsr_path).ok()?;
        let route = found.value.get(method)?;
        if !route.tsr {
            return None;
        }

        Some(
            hyper::Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header("Location", tsr_path)
                .body(TakoBody::empty())
                .unwrap(),
        )
    }

    /// Adds global middleware to the router.
    ///
    /// Global middleware is executed for all routes in the order it was added, before
    /// any route-specific middleware.
    pub fn middleware<F, Fut, R>(&self, f: F) -> &Self
    where
        F: Fn(Request, Next) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: Responder + Send + 'static,
    {
        let mw: BoxMiddleware = Arc::new(move |req, next| {
            let fut = f(req, next);
            Box::pin(async move { fut.await.into_response() })
        });

        self.middlewares.write().unwrap().push(mw);
        self
    }

    /// Registers a plugin with the router.
    #[cfg(feature = "plugins")]
    pub fn plugin<P>(&mut self, plugin: P) -> &mut Self
    where
        P: TakoPlugin + Clone + Send + Sync + 'static,
    {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Returns references to all registered plugins.
    #[cfg(feature = "plugins")]
    pub(crate) fn plugins(&self) -> Vec<&dyn TakoPlugin> {
        self.plugins.iter().map(|plugin| plugin.as_ref()).collect()
    }

    /// Initializes all registered plugins exactly once.
    #[cfg(feature = "plugins")]
    pub(crate) fn setup_plugins_once(&self) {
        use std::sync::atomic::Ordering;

        if !self.plugins_initialized.swap(true, Ordering::SeqCst) {
            for plugin in self.plugins() {
                let _ = plugin.setup(self);
            }
        }
    }

    /// Merges another router's routes and middleware into this one.
    ///
    /// Routes are re-registered under this router's trie; the other router's global
    /// middleware is prepended to each merged route's own middleware chain so it still
    /// runs ahead of this router's route-level middleware but after this router's
    /// global middleware (which already ran by the time `dispatch` reaches per-route
    /// middleware).
    ///
    /// # Panics
    ///
    /// Panics if a merged route collides with an existing method/path registration.
    pub fn merge(&mut self, other: Router) {
        let other_global = other.middlewares.read().unwrap().clone();
        let nodes: Vec<Arc<RouteNode>> = other.nodes.read().unwrap().values().cloned().collect();

        for node in nodes {
            let routes: Vec<Arc<Route>> = node
                .by_method
                .read()
                .unwrap()
                .iter()
                .map(|(_, r)| r.clone())
                .chain(node.any.read().unwrap().clone())
                .collect();

            for route in routes {
                for mw in other_global.iter().rev() {
                    route.middlewares.write().unwrap().push_front(mw.clone());
                }
                self.try_insert(route).unwrap_or_else(|err| panic!("{err}"));
            }
        }
    }
}

/// Percent-decodes a single captured path-parameter value.
///
/// Route parameters are decoded individually rather than relying on whole-path
/// decoding, so a literal `%2F` inside a `{name}` segment doesn't get reinterpreted as a
/// path separator during matching.
fn decode_param(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn method_not_allowed_response(allowed: &[Method]) -> Response {
    let allow_header = allowed
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");

    hyper::Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header(http::header::ALLOW, allow_header)
        .body(TakoBody::empty())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::TakoBody;
    use http_body_util::BodyExt;

    async fn ok(_req: Request) -> &'static str {
        "ok"
    }

    fn get_req(path: &str) -> Request {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(TakoBody::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn matches_named_params() {
        let mut router = Router::new();
        router.route(Method::GET, "/users/{id}", |req: Request| async move {
            let params = req.extensions().get::<PathParams>().unwrap();
            params.0.get("id").cloned().unwrap_or_default()
        });

        let res = router.dispatch(get_req("/users/42")).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"42");
    }

    #[tokio::test]
    async fn method_not_allowed_carries_allow_header() {
        let mut router = Router::new();
        router.route(Method::POST, "/users", ok);

        let res = router.dispatch(get_req("/users")).await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers().get(http::header::ALLOW).unwrap(), "POST");
    }

    #[tokio::test]
    async fn any_fallback_only_applies_when_nothing_else_matches() {
        let mut router = Router::new();
        router.route(Method::GET, "/probe", ok);
        router.route_any("/probe", |_req: Request| async { "any" });

        let res = router.dispatch(get_req("/probe")).await;
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        let post_req = Request::builder()
            .method(Method::POST)
            .uri("/probe")
            .body(TakoBody::empty())
            .unwrap();
        let res = router.dispatch(post_req).await;
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"any");
    }

    #[tokio::test]
    async fn unmatched_path_is_not_found() {
        let router = Router::new();
        let res = router.dispatch(get_req("/missing")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut router = Router::new();
        router.route(Method::GET, "/dup", ok);
        let err = router.try_route(Method::GET, "/dup", ok).unwrap_err();
        assert!(matches!(err, RouteError::Duplicate { .. }));
    }
}
