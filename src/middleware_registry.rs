//! Path-glob-scoped middleware registry.
//!
//! [`crate::router::Router`] already stacks middleware per concrete route
//! registration (global, then route-level). This registry adds the other axis the
//! scripting host needs: middleware mounted against a glob pattern (`*`, `**`,
//! `foo/*`) that applies to every request whose path matches, independent of
//! whether a route ends up matching at all. A request's full chain is the
//! concatenation, in registration order, of every pattern's middleware list whose
//! glob matches the path — duplicates included, since a host may intentionally
//! stack the same middleware under two patterns.
//!
//! Resolving a glob chain is pure in `(path, registration sequence)`, so results
//! are cached: once the registry is built (it becomes immutable after
//! [`Router`](crate::router::Router)'s `listen`), the same path always re-derives
//! the same chain, and a bounded LRU spares the pattern scan on hot paths.

use std::sync::{Arc, Mutex};

use glob::{MatchOptions, Pattern};
use lru::LruCache;

/// `*` must stay within one path segment and `**` must cross segments — the
/// `glob` crate only gives us that distinction with `require_literal_separator`
/// set; its default `matches` lets a bare `*` span `/` like `**` would.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
  case_sensitive: true,
  require_literal_separator: true,
  require_literal_leading_dot: false,
};

use crate::types::BoxMiddleware;

/// One registered pattern and the middleware stacked under it, in registration
/// order.
struct Entry {
  pattern: String,
  compiled: Option<Pattern>,
  middlewares: Vec<BoxMiddleware>,
}

/// Registry of glob-scoped middleware chains.
///
/// `*` is special-cased to match every path (the `glob` crate's own `*` only
/// matches within a single path component, which is narrower than the registry's
/// documented "match all paths" semantics for that one pattern). Every other
/// pattern is compiled with [`glob::Pattern`], whose `**` already crosses
/// component boundaries the way the spec's glob semantics require.
pub struct MiddlewareRegistry {
  entries: Vec<Entry>,
  cache: Mutex<LruCache<String, Arc<Vec<BoxMiddleware>>>>,
}

impl MiddlewareRegistry {
  /// Creates an empty registry with a chain-resolution cache sized for
  /// `cache_capacity` distinct paths.
  pub fn new(cache_capacity: usize) -> Self {
    let capacity = std::num::NonZeroUsize::new(cache_capacity.max(1)).unwrap();
    Self {
      entries: Vec::new(),
      cache: Mutex::new(LruCache::new(capacity)),
    }
  }

  /// Registers `middleware` under `pattern`. Multiple registrations for the same
  /// pattern string accumulate rather than replace; `chain` concatenates them in
  /// the order they were registered, interleaved with other patterns' entries
  /// also in registration order.
  ///
  /// # Panics
  ///
  /// Panics if `pattern` isn't a well-formed glob (and isn't the literal `*`).
  pub fn register(&mut self, pattern: impl Into<String>, middleware: BoxMiddleware) {
    let pattern = pattern.into();
    if let Some(entry) = self.entries.iter_mut().find(|e| e.pattern == pattern) {
      entry.middlewares.push(middleware);
      return;
    }

    let compiled = if pattern == "*" {
      None
    } else {
      Some(Pattern::new(&pattern).unwrap_or_else(|e| panic!("invalid middleware pattern {pattern:?}: {e}")))
    };

    self.entries.push(Entry {
      pattern,
      compiled,
      middlewares: vec![middleware],
    });
  }

  /// Resolves the ordered middleware chain applicable to `path`, consulting (and
  /// populating) the bounded cache.
  pub fn chain(&self, path: &str) -> Arc<Vec<BoxMiddleware>> {
    if let Some(hit) = self.cache.lock().unwrap().get(path) {
      return hit.clone();
    }

    let mut resolved = Vec::new();
    for entry in &self.entries {
      let matches = match &entry.compiled {
        None => true,
        Some(pattern) => pattern.matches_with(path, GLOB_OPTIONS),
      };
      if matches {
        resolved.extend(entry.middlewares.iter().cloned());
      }
    }

    let resolved = Arc::new(resolved);
    self.cache.lock().unwrap().put(path.to_string(), resolved.clone());
    resolved
  }

  /// Number of distinct patterns registered (not the number of middlewares).
  pub fn pattern_count(&self) -> usize {
    self.entries.len()
  }
}

impl Default for MiddlewareRegistry {
  fn default() -> Self {
    Self::new(1024)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{middleware::Next, types::Request};
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn marker(counter: Arc<AtomicUsize>) -> BoxMiddleware {
    Arc::new(move |req: Request, next: Next| {
      let counter = counter.clone();
      Box::pin(async move {
        counter.fetch_add(1, Ordering::SeqCst);
        next.run(req).await
      })
    })
  }

  #[test]
  fn star_matches_every_path() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = MiddlewareRegistry::default();
    registry.register("*", marker(counter));

    assert_eq!(registry.chain("/anything/at/all").len(), 1);
    assert_eq!(registry.chain("/").len(), 1);
  }

  #[test]
  fn single_segment_glob_does_not_cross_slashes() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = MiddlewareRegistry::default();
    registry.register("foo/*", marker(counter));

    assert_eq!(registry.chain("foo/bar").len(), 1);
    assert_eq!(registry.chain("foo/bar/baz").len(), 0);
  }

  #[test]
  fn double_star_crosses_segments() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = MiddlewareRegistry::default();
    registry.register("foo/**", marker(counter));

    assert_eq!(registry.chain("foo/bar/baz").len(), 1);
  }

  #[test]
  fn duplicate_pattern_registrations_accumulate_in_order() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = MiddlewareRegistry::default();
    registry.register("/api", marker(counter.clone()));
    registry.register("/api", marker(counter));

    assert_eq!(registry.chain("/api").len(), 2);
  }

  #[test]
  fn chain_is_a_pure_function_of_path_and_registration() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = MiddlewareRegistry::default();
    registry.register("*", marker(counter));

    let a = registry.chain("/x").len();
    let b = registry.chain("/x").len();
    assert_eq!(a, b);
  }
}
