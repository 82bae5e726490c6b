//! HTTP route definition and path matching functionality.
//!
//! This module provides the core `Route` struct for defining HTTP routes with path
//! patterns, parameter extraction, and middleware support. Routes can contain dynamic
//! segments like `{id}` and catch-all segments like `{*rest}` that are captured as
//! parameters, and support method-specific handlers with optional trailing slash
//! redirection and route-specific middleware chains. Path matching itself is delegated
//! to a [`matchit::Router`] trie owned by [`crate::router::Router`]; this module only
//! models what is stored at each matched node.
//!
//! # Examples
//!
//! ```rust
//! use tako::route::Route;
//! use tako::handler::BoxHandler;
//! use tako::types::Request;
//! use http::Method;
//!
//! async fn handler(_req: Request) -> &'static str {
//!     "Hello, World!"
//! }
//!
//! let route = Route::new(
//!     "/users/{id}".to_string(),
//!     Method::GET,
//!     BoxHandler::new(handler),
//!     None
//! );
//! ```

use std::{
    collections::VecDeque,
    sync::{Arc, RwLock},
};

use http::Method;

use crate::{
    handler::BoxHandler,
    middleware::Next,
    responder::Responder,
    types::{BoxMiddleware, Request},
};

/// HTTP route with a handler, method, and route-specific middleware chain.
///
/// The path pattern itself is no longer matched by `Route` directly — registration
/// inserts the pattern into the owning [`crate::router::Router`]'s `matchit` trie, which
/// performs the actual segment matching (literal, `{name}`, and `{*rest}` catch-all) and
/// hands back the captured parameters.
pub struct Route {
    /// Original path pattern string used to register this route.
    pub path: String,
    /// HTTP method this route responds to.
    pub method: Method,
    /// Handler function to execute when route is matched.
    pub handler: BoxHandler,
    /// Route-specific middleware chain.
    pub middlewares: RwLock<VecDeque<BoxMiddleware>>,
    /// Whether trailing slash redirection is enabled.
    pub tsr: bool,
}

impl Route {
    /// Creates a new route with the specified path, method, and handler.
    pub fn new(path: String, method: Method, handler: BoxHandler, tsr: Option<bool>) -> Self {
        Self {
            path,
            method,
            handler,
            middlewares: RwLock::new(VecDeque::new()),
            tsr: tsr.unwrap_or(false),
        }
    }

    /// Adds middleware to this route's execution chain.
    pub fn middleware<F, Fut, R>(&self, f: F) -> &Self
    where
        F: Fn(Request, Next) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: Responder + Send + 'static,
    {
        let mw: BoxMiddleware = Arc::new(move |req, next| {
            let fut = f(req, next); // Fut<'a>

            Box::pin(async move { fut.await.into_response() })
        });

        self.middlewares.write().unwrap().push_back(mw);
        self
    }
}

/// Per-path trie node: holds one route per concrete HTTP method plus an optional
/// `ANY`-method fallback route, since `matchit` stores exactly one value per pattern and
/// several methods can share the same pattern (`GET /users/{id}` and `DELETE
/// /users/{id}`).
#[derive(Default)]
pub struct RouteNode {
    pub(crate) by_method: RwLock<Vec<(Method, Arc<Route>)>>,
    pub(crate) any: RwLock<Option<Arc<Route>>>,
}

impl RouteNode {
    pub(crate) fn insert(&self, route: Arc<Route>, is_any: bool) -> Result<(), RouteError> {
        if is_any {
            let mut any = self.any.write().unwrap();
            if any.is_some() {
                return Err(RouteError::Duplicate {
                    method: route.method.clone(),
                    path: route.path.clone(),
                });
            }
            *any = Some(route);
            return Ok(());
        }

        let mut by_method = self.by_method.write().unwrap();
        if by_method.iter().any(|(m, _)| *m == route.method) {
            return Err(RouteError::Duplicate {
                method: route.method.clone(),
                path: route.path.clone(),
            });
        }
        by_method.push((route.method.clone(), route));
        Ok(())
    }

    /// Finds the route for an exact method, falling back to the `ANY` entry.
    pub(crate) fn get(&self, method: &Method) -> Option<Arc<Route>> {
        self.by_method
            .read()
            .unwrap()
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, r)| r.clone())
            .or_else(|| self.any.read().unwrap().clone())
    }

    /// All methods registered for this node, for building the `Allow` header on a
    /// `405 Method Not Allowed` response.
    pub(crate) fn allowed_methods(&self) -> Vec<Method> {
        self.by_method
            .read()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }
}

/// Registration-time routing errors.
#[derive(Debug)]
pub enum RouteError {
    /// A route with this method and path pattern is already registered.
    Duplicate { method: Method, path: String },
    /// The path pattern could not be compiled into a trie entry (conflicting wildcard
    /// placement, invalid syntax, etc).
    InvalidPattern { path: String, reason: String },
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::Duplicate { method, path } => {
                write!(f, "duplicate route registration: {method} {path}")
            }
            RouteError::InvalidPattern { path, reason } => {
                write!(f, "invalid route pattern {path:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for RouteError {}

/// Outcome of matching an incoming request's method and path against the route table.
pub enum MatchOutcome {
    /// A route matched; carries the route and its captured path parameters.
    Matched {
        route: Arc<Route>,
        params: std::collections::HashMap<String, String>,
    },
    /// No pattern in the trie matched the path at all.
    NotFound,
    /// At least one pattern matched the path, but none of its registered methods (nor
    /// an `ANY` fallback) matched the request's method.
    MethodNotAllowed(Vec<Method>),
}
