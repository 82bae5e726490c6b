//! Middleware system for request and response processing pipelines.
//!
//! This module provides the core middleware infrastructure for Tako, allowing you to
//! compose request processing pipelines. Middleware can modify requests, responses,
//! or perform side effects like logging, authentication, or rate limiting. The `Next`
//! struct manages the execution flow through the middleware chain to the final handler.
//!
//! # Examples
//!
//! ```rust
//! use tako::{middleware::Next, types::{Request, Response}};
//! use std::{pin::Pin, future::Future};
//!
//! async fn logging_middleware(req: Request, next: Next) -> Response {
//!     println!("Processing request to: {}", req.uri());
//!     let response = next.run(req).await;
//!     println!("Response status: {}", response.status());
//!     response
//! }
//! ```

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    handler::BoxHandler,
    responder::Responder,
    types::{BoxMiddleware, Request, Response},
};

pub mod basic_auth;
pub mod bearer_auth;
pub mod body_limit;
pub mod jwt_auth;

/// Outcome of a single step through the middleware chain.
///
/// Middleware always produces a [`Response`] (never a bare `Result`), but the chain
/// still needs to distinguish "this response came from calling `next`" from "this
/// middleware terminated the chain itself" so instrumentation (and the bridge, when a
/// host-implemented [`crate::bridge::HandlerInvoker`] is in play) can tell whether the
/// route handler actually ran. `Next::run` keeps returning a bare `Response` for
/// ergonomics; `ChainSignal` is what `Next::run_signal` and the pipeline use internally
/// when that distinction matters.
#[derive(Debug)]
pub enum ChainSignal {
    /// The remaining chain ran to completion (handler included).
    Continue(Response),
    /// A middleware returned a response without invoking `next`, or called `next.fail`.
    Terminated(Response),
}

impl ChainSignal {
    /// Unwraps the signal into its response, discarding whether it terminated early.
    pub fn into_response(self) -> Response {
        match self {
            ChainSignal::Continue(res) => res,
            ChainSignal::Terminated(res) => res,
        }
    }
}

/// Trait for converting types into middleware functions.
///
/// This trait allows various types to be converted into middleware that can be used
/// in the Tako middleware pipeline. Middleware functions take a request and the next
/// middleware in the chain, returning a future that resolves to a response.
///
/// # Examples
///
/// ```rust
/// use tako::middleware::{IntoMiddleware, Next};
/// use tako::types::{Request, Response};
/// use std::{pin::Pin, future::Future};
///
/// struct LoggingMiddleware;
///
/// impl IntoMiddleware for LoggingMiddleware {
///     fn into_middleware(
///         self,
///     ) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send + 'static>>
///     + Clone + Send + Sync + 'static {
///         |req, next| {
///             Box::pin(async move {
///                 println!("Request: {}", req.uri());
///                 next.run(req).await
///             })
///         }
///     }
/// }
/// ```
pub trait IntoMiddleware {
    fn into_middleware(
        self,
    ) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send + 'static>>
    + Clone
    + Send
    + Sync
    + 'static;
}

/// Represents the next step in the middleware execution chain.
///
/// The `Next` struct manages the flow of execution through a middleware stack,
/// ensuring each middleware is called in order before reaching the final endpoint
/// handler. It contains references to the remaining middlewares and the final
/// endpoint to be executed.
pub struct Next {
    /// Remaining middlewares to be executed in the chain.
    pub middlewares: Arc<Vec<BoxMiddleware>>,
    /// Final endpoint handler to be called after all middlewares.
    pub endpoint: Arc<BoxHandler>,
}

impl Next {
    /// Executes the next middleware or endpoint in the chain.
    ///
    /// This method processes the middleware chain by either calling the next middleware
    /// (if any remain) or the final endpoint handler. It maintains the proper execution
    /// order and passes the request through each layer of the middleware stack.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tako::middleware::Next;
    /// use tako::types::Request;
    /// use std::sync::Arc;
    ///
    /// # async fn example() {
    /// # let middlewares = Arc::new(Vec::new());
    /// # let endpoint = Arc::new(|_req| Box::pin(async {
    /// #     tako::types::Response::new(tako::body::TakoBody::empty())
    /// # }) as std::pin::Pin<Box<dyn std::future::Future<Output = _> + Send>>);
    /// let next = Next {
    ///     middlewares,
    ///     endpoint,
    /// };
    ///
    /// let request = Request::builder().body(tako::body::TakoBody::empty()).unwrap();
    /// let response = next.run(request).await;
    /// # }
    /// ```
    pub async fn run(self, req: Request) -> Response {
        if let Some((mw, rest)) = self.middlewares.split_first() {
            let rest = Arc::new(rest.to_vec());
            mw(
                req,
                Next {
                    middlewares: rest,
                    endpoint: self.endpoint.clone(),
                },
            )
            .await
        } else {
            self.endpoint.call(req).await
        }
    }

    /// Runs the chain the same way as [`Next::run`], but tags whether the handler at
    /// the end of the chain actually executed. Used by `pipeline` to decide whether a
    /// request counts as "handled" for metrics purposes, and by middleware that wants
    /// to branch on whether a downstream layer already terminated the chain.
    ///
    /// Detection works by swapping in an endpoint that flips a marker before calling
    /// through to the real one, then running the chain exactly as `run` would. If the
    /// marker never flips, some middleware returned its own response (or called
    /// `next.fail`) instead of reaching the end of the chain.
    pub async fn run_signal(self, req: Request) -> ChainSignal {
        let reached = Arc::new(AtomicBool::new(false));
        let marker = reached.clone();
        let endpoint = self.endpoint;
        let marked: BoxHandler = BoxHandler::new(move |req: Request| {
            let marker = marker.clone();
            let endpoint = endpoint.clone();
            async move {
                marker.store(true, Ordering::SeqCst);
                endpoint.call(req).await
            }
        });

        let next = Next {
            middlewares: self.middlewares,
            endpoint: Arc::new(marked),
        };
        let response = next.run(req).await;

        if reached.load(Ordering::SeqCst) {
            ChainSignal::Continue(response)
        } else {
            ChainSignal::Terminated(response)
        }
    }

    /// Terminates the chain immediately with an error response, without calling the
    /// next middleware or the route handler.
    ///
    /// This is the explicit counterpart to simply returning a response instead of
    /// calling `next.run(req)` — both stop the chain, but `next.fail(err)` makes the
    /// intent (and the error type) visible at the call site.
    ///
    /// ```rust
    /// use tako::middleware::Next;
    /// use http::StatusCode;
    ///
    /// # async fn example(next: Next) -> tako::types::Response {
    /// next.fail((StatusCode::FORBIDDEN, "missing permission"))
    /// # }
    /// ```
    pub fn fail<E: Responder>(self, err: E) -> Response {
        err.into_response()
    }
}
