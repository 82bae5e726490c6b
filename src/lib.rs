#![cfg_attr(docsrs, feature(doc_cfg))]

//! A lightweight, modular web framework for async applications.
//!
//! Tako focuses on ergonomics and composability. It provides routing, extractors,
//! responses, middleware, a bridged request pipeline, static file caching,
//! WebSockets with rooms, streaming, templating, and optional TLS, built to be
//! embedded by a scripting host rather than run standalone.
//!
//! # High-level features
//! - Macro-free routing with dynamic path params and TSR support
//! - Type-safe handlers with extractor-based arguments (Axum-like ergonomics)
//! - Simple `Responder` trait to return strings, tuples, or full responses
//! - Middleware pipeline (auth, body limits, etc.), a glob-scoped [middleware_registry],
//!   and optional plugins (CORS, compression, rate limits, metrics)
//! - A [pipeline] that bridges matched routes and middleware to a pluggable
//!   [bridge::HandlerInvoker] under a bounded deadline
//! - An in-memory [static_cache] with conditional GET, ETags, and precompressed variants
//! - A room-aware [ws_hub] on top of the raw [ws] handshake primitive
//! - A [template] facade for server-rendered views
//! - Streaming bodies, file serving, range requests, and SSE
//! - Optional TLS (rustls)
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP: `hyper` 1.x
//!
//! # Quickstart
//!
//! ```rust
//! use tako::{Method, router::Router, responder::Responder, types::Request};
//!
//! async fn hello(_: Request) -> impl Responder { "Hello, World!" }
//!
//! let mut router = Router::new();
//! router.route(Method::GET, "/", hello);
//! ```
//!
//! # Key concepts
//! - [router::Router] manages routes, middleware and dispatch.
//! - [extractors] parse request data (headers, params, JSON, forms, etc.).
//! - [responder::Responder] converts return values into HTTP responses.
//! - [middleware] composes cross-cutting concerns; [middleware_registry] adds a
//!   glob-scoped second axis independent of route registration.
//! - [bridge] decouples invocation of a matched route or middleware from how it
//!   actually executes, so a scripting host can sit behind it.
//! - [pipeline] is the per-request orchestration: static files, the middleware
//!   registry, routing, the bridge, and error rendering in one place.
//!
//! - [static_cache] and [file_stream] provide static and streaming file responses.
//! - [ws] and [ws_hub] provide raw and room-aware WebSocket support; [sse] covers
//!   one-way server push.
//! - [plugins] add CORS, compression, rate limiting, and metrics (feature: `plugins`).
//!
//! # Feature flags
//! - `file-stream` — file streaming utilities
//! - `jemalloc` — use jemalloc as global allocator
//! - `multipart` — multipart form-data extractors
//! - `plugins` — CORS, compression, rate limiting, metrics
//! - `tls` — TLS server (rustls)
//! - `tako-tracing` — structured tracing subscriber

/// HTTP request and response body handling utilities.
pub mod body;

/// Decouples pipeline invocation of a route or middleware from its execution strategy.
pub mod bridge;

/// Request data extraction utilities for parsing query params, JSON, and more.
pub mod extractors;

/// File streaming utilities for serving files.
#[cfg(feature = "file-stream")]
#[cfg_attr(docsrs, doc(cfg(feature = "file-stream")))]
pub mod file_stream;

/// Request handler traits and implementations.
mod handler;

/// Middleware for processing requests and responses in a pipeline.
pub mod middleware;

/// Glob-scoped middleware registry, independent of per-route registration.
pub mod middleware_registry;

/// Per-request orchestration: static files, middleware, routing, and the bridge.
pub mod pipeline;

/// Plugin system for extending framework functionality.
#[cfg(feature = "plugins")]
#[cfg_attr(docsrs, doc(cfg(feature = "plugins")))]
pub mod plugins;

/// Response generation utilities and traits.
pub mod responder;

/// Redirection utilities for handling HTTP redirects.
pub mod redirect;

/// Route definition and matching logic.
mod route;

/// Request routing and dispatch functionality.
pub mod router;

/// HTTP server implementation and configuration.
mod server;

/// Server-Sent Events (SSE) support for real-time communication.
pub mod sse;

/// Application state management and dependency injection.
pub mod state;

/// In-process signal arbiter for custom events.
pub mod signals;

/// In-memory static file cache with conditional responses and precompression.
pub mod static_cache;

/// Server-rendered template facade.
pub mod template;

/// Distributed tracing integration for observability.
#[cfg(feature = "tako-tracing")]
#[cfg_attr(docsrs, doc(cfg(feature = "tako-tracing")))]
pub mod tracing;

/// Core type definitions used throughout the framework.
pub mod types;

/// WebSocket connection handling and message processing.
pub mod ws;

/// Room-aware WebSocket hub built on top of [ws].
pub mod ws_hub;

pub use bytes::Bytes;
pub use http::{Method, StatusCode, header};
pub use http_body_util::Full;
pub use responder::NOT_FOUND;

/// Starts the HTTP server with the given listener and router.
///
/// This is the main entry point for starting a Tako web server. The function takes
/// ownership of a TCP listener and router, then serves incoming connections until
/// the server is shut down.
///
/// # Examples
///
/// ```rust,no_run
/// use tako::{serve, router::Router};
/// use tokio::net::TcpListener;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("127.0.0.1:8080").await?;
/// let router = Router::new();
/// serve(listener, router).await;
/// # Ok(())
/// # }
/// ```
pub use server::serve;

/// TLS/SSL server implementation for secure connections.
#[cfg(feature = "tls")]
#[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
pub mod server_tls;

/// Starts the HTTPS server with TLS encryption support.
///
/// Similar to `serve` but enables TLS encryption for secure connections. Requires
/// the "tls" feature to be enabled and proper TLS configuration.
///
/// # Examples
///
/// ```rust,no_run
/// # #[cfg(feature = "tls")]
/// use tako::{serve_tls, router::Router};
/// # #[cfg(feature = "tls")]
/// use tokio::net::TcpListener;
///
/// # #[cfg(feature = "tls")]
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("127.0.0.1:8443").await?;
/// let router = Router::new();
/// // serve_tls(listener, router, tls_config).await;
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "tls")]
#[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
pub use server_tls::serve_tls;

/// Global memory allocator using jemalloc for improved performance.
#[cfg(feature = "jemalloc")]
#[cfg_attr(docsrs, doc(cfg(feature = "jemalloc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;
