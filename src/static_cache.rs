//! Caching static file server with conditional responses and precompressed variants.
//!
//! This module replaces the teacher's `ServeDir`/`ServeFile` (see `static.rs`, dropped in
//! the final trim pass) with a cache that keeps small-to-medium files resident in memory,
//! pre-encodes gzip and brotli variants once per file, and answers conditional GETs
//! (`If-None-Match`/`If-Modified-Since`) with `304 Not Modified` without touching disk
//! again. Large files above [`Mount::max_cached_size`] stream straight from disk via
//! [`crate::file_stream::FileStream`] instead of being cached.
//!
//! Multiple [`Mount`]s can overlap; the first one registered whose prefix matches wins,
//! mirroring how [`crate::router::Router`] keeps registration order significant for its
//! `ANY` fallback.

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
  sync::Arc,
  time::SystemTime,
};

use http::{
  HeaderValue, StatusCode,
  header::{
    ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, VARY,
  },
};
use mime_guess::MimeGuess;
use scc::HashMap as SccHashMap;
use sha1::{Digest, Sha1};
use tokio::{fs, sync::OnceCell};

use crate::{
  body::TakoBody,
  file_stream::FileStream,
  plugins::compression::{compress_brotli, compress_gzip},
  responder::Responder,
  signals::{EventBus, Signal, app_events, ids},
  types::{Request, Response},
};

/// A single cached file variant: its bytes, a strong ETag, and a formatted
/// `Last-Modified` timestamp.
#[derive(Clone)]
struct CacheEntry {
  mime: mime_guess::Mime,
  etag: String,
  last_modified: SystemTime,
  last_modified_http: String,
  plain: bytes::Bytes,
  gzip: Option<bytes::Bytes>,
  brotli: Option<bytes::Bytes>,
}

impl CacheEntry {
  fn best_for(&self, accept_encoding: &str) -> (Option<&'static str>, &bytes::Bytes) {
    let accept_encoding = accept_encoding.to_ascii_lowercase();
    if accept_encoding.contains("br")
      && let Some(br) = &self.brotli
    {
      return (Some("br"), br);
    }
    if accept_encoding.contains("gzip")
      && let Some(gz) = &self.gzip
    {
      return (Some("gzip"), gz);
    }
    (None, &self.plain)
  }
}

/// A directory mounted under a URL prefix, with its own caching, compression, and
/// access-control options.
pub struct Mount {
  /// URL path prefix this mount answers for, e.g. `/assets`.
  pub prefix: String,
  /// Filesystem directory the prefix is rooted at.
  pub root: PathBuf,
  /// Whether served files are kept in the in-memory cache at all. When `false`, every
  /// request re-reads and (if enabled) re-compresses the file from disk; useful for
  /// directories that change on every request in development.
  pub cache: bool,
  /// Files larger than this are streamed from disk instead of cached. Defaults to 5 MiB.
  pub max_cached_size: u64,
  /// `Cache-Control: public, max-age=<seconds>` sent with every served file.
  pub max_age_seconds: u32,
  /// Whether to compute and send an `ETag` header.
  pub emit_etag: bool,
  /// Whether to compute and send a `Last-Modified` header.
  pub emit_last_modified: bool,
  /// Whether to precompute and offer a gzip-encoded variant.
  pub enable_gzip: bool,
  /// Whether to precompute and offer a brotli-encoded variant.
  pub enable_brotli: bool,
  /// Whether dotfiles (any path segment starting with `.`) may be served.
  pub allow_hidden: bool,
  /// Whether symlinks within the mount may be served. When `false`, a symlinked entry
  /// is rejected rather than followed, since it can point outside the mount root.
  pub allow_system: bool,
  /// If non-empty, only files whose extension (case-insensitive, without the leading
  /// dot) appears here are served; everything else is rejected.
  pub allowed_extensions: HashSet<String>,
  /// Relative paths (as requested, e.g. `"secrets/keys.pem"`) that are always rejected
  /// regardless of `allowed_extensions`.
  pub blocked_paths: HashSet<String>,
  /// File served (if present) when a path under this mount isn't found on disk, for
  /// single-page-application style client routing.
  pub fallback: Option<PathBuf>,
}

impl Mount {
  /// Creates a mount with caching, ETags, Last-Modified, and both compressed variants
  /// enabled, a 5 MiB cache cutoff, a one hour max-age, hidden/system files rejected,
  /// no extension or path restrictions, and no SPA fallback.
  pub fn new<P: Into<PathBuf>>(prefix: impl Into<String>, root: P) -> Self {
    Self {
      prefix: prefix.into(),
      root: root.into(),
      cache: true,
      max_cached_size: 5 * 1024 * 1024,
      max_age_seconds: 3600,
      emit_etag: true,
      emit_last_modified: true,
      enable_gzip: true,
      enable_brotli: true,
      allow_hidden: false,
      allow_system: false,
      allowed_extensions: HashSet::new(),
      blocked_paths: HashSet::new(),
      fallback: None,
    }
  }

  /// Sets the SPA fallback file.
  pub fn with_fallback<P: Into<PathBuf>>(mut self, fallback: P) -> Self {
    self.fallback = Some(fallback.into());
    self
  }

  /// Overrides the in-memory cache size cutoff.
  pub fn with_max_cached_size(mut self, bytes: u64) -> Self {
    self.max_cached_size = bytes;
    self
  }

  /// Disables the in-memory cache entirely; every request reads fresh from disk.
  pub fn without_cache(mut self) -> Self {
    self.cache = false;
    self
  }

  /// Overrides the `Cache-Control` max-age, in seconds.
  pub fn with_max_age_seconds(mut self, seconds: u32) -> Self {
    self.max_age_seconds = seconds;
    self
  }

  /// Toggles `ETag` emission.
  pub fn with_etag(mut self, emit: bool) -> Self {
    self.emit_etag = emit;
    self
  }

  /// Toggles `Last-Modified` emission.
  pub fn with_last_modified(mut self, emit: bool) -> Self {
    self.emit_last_modified = emit;
    self
  }

  /// Toggles gzip precompression.
  pub fn with_gzip(mut self, enabled: bool) -> Self {
    self.enable_gzip = enabled;
    self
  }

  /// Toggles brotli precompression.
  pub fn with_brotli(mut self, enabled: bool) -> Self {
    self.enable_brotli = enabled;
    self
  }

  /// Allows dotfiles to be served.
  pub fn allowing_hidden(mut self) -> Self {
    self.allow_hidden = true;
    self
  }

  /// Allows symlinked entries to be served.
  pub fn allowing_system(mut self) -> Self {
    self.allow_system = true;
    self
  }

  /// Restricts served files to the given extensions (without the leading dot).
  pub fn with_allowed_extensions<I, S>(mut self, extensions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.allowed_extensions = extensions.into_iter().map(|ext| ext.into().to_ascii_lowercase()).collect();
    self
  }

  /// Blocks the given relative paths regardless of extension.
  pub fn with_blocked_paths<I, S>(mut self, paths: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.blocked_paths = paths.into_iter().map(Into::into).collect();
    self
  }

  fn strip_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(&self.prefix)?;
    if self.prefix.ends_with('/') {
      Some(rest)
    } else {
      rest.strip_prefix('/').or(Some(rest))
    }
  }

  fn resolve(&self, rel: &str) -> Option<PathBuf> {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
      return Some(self.root.clone());
    }
    // Reject any segment that could escape the mount root before touching the
    // filesystem; `canonicalize` below still double-checks against symlinks.
    if rel.split('/').any(|seg| seg == ".." || seg == ".") {
      return None;
    }
    Some(self.root.join(rel))
  }

  /// Checks the access-control options (hidden files, extension allowlist, blocked
  /// paths) against a request-relative path, ahead of ever touching the filesystem for
  /// symlink status.
  fn security_reject(&self, rel: &str) -> bool {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
      return false;
    }
    if self.blocked_paths.contains(rel) {
      return true;
    }
    if !self.allow_hidden && rel.split('/').any(|seg| seg.starts_with('.')) {
      return true;
    }
    if !self.allowed_extensions.is_empty() {
      let ext = Path::new(rel)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
      match ext {
        Some(ext) if self.allowed_extensions.contains(&ext) => {}
        _ => return true,
      }
    }
    false
  }
}

/// In-memory cache of static files behind one or more [`Mount`]s.
///
/// Cache fills are deduplicated per path via a striped `Arc<OnceCell<_>>` stored in the
/// underlying [`scc::HashMap`] bucket: concurrent requests for a cold file all await the
/// same fill rather than each reading and compressing the file independently.
pub struct StaticCache {
  mounts: Vec<Mount>,
  entries: SccHashMap<PathBuf, Arc<OnceCell<Option<CacheEntry>>>>,
  events: EventBus,
}

impl StaticCache {
  /// Creates an empty cache with no mounts, emitting cache hit/miss signals on the
  /// global application event bus by default.
  pub fn new() -> Self {
    Self {
      mounts: Vec::new(),
      entries: SccHashMap::new(),
      events: app_events().clone(),
    }
  }

  /// Registers a mount. Mounts are consulted in registration order; the first whose
  /// prefix matches a request path wins even if a later mount's prefix also matches.
  pub fn mount(mut self, mount: Mount) -> Self {
    self.mounts.push(mount);
    self
  }

  /// Overrides which event bus cache hit/miss signals (`ids::CACHE_HIT`/`CACHE_MISS`)
  /// are emitted on, so a [`crate::pipeline::Pipeline`] can route them to the same bus
  /// its own request lifecycle signals use.
  pub fn with_events(mut self, events: EventBus) -> Self {
    self.events = events;
    self
  }

  /// Drops every cached entry, forcing the next request for each path to re-read and
  /// re-compress from disk. Useful for a file-watcher-triggered reload in development.
  pub async fn flush(&self) {
    self.entries.clear_async().await;
  }

  /// Serves a request, or falls through to `None` if no mount's prefix matches the
  /// request path at all (so the caller can continue dispatching to other routes).
  pub async fn handle(&self, req: &Request) -> Option<Response> {
    let path = req.uri().path();
    for mount in &self.mounts {
      let Some(rel) = mount.strip_prefix(path) else {
        continue;
      };
      if mount.security_reject(rel) {
        return Some((StatusCode::FORBIDDEN, "Forbidden").into_response());
      }
      let Some(fs_path) = mount.resolve(rel) else {
        return Some((StatusCode::FORBIDDEN, "Forbidden").into_response());
      };
      if let Some(resp) = self.serve_path(req, mount, &fs_path).await {
        return Some(resp);
      }
      if let Some(fallback) = &mount.fallback
        && let Some(resp) = self.serve_path(req, mount, fallback).await
      {
        return Some(resp);
      }
      return Some((StatusCode::NOT_FOUND, "Not Found").into_response());
    }
    None
  }

  async fn serve_path(&self, req: &Request, mount: &Mount, fs_path: &Path) -> Option<Response> {
    if !mount.allow_system {
      let link_metadata = fs::symlink_metadata(fs_path).await.ok()?;
      if link_metadata.is_symlink() {
        return Some((StatusCode::FORBIDDEN, "Forbidden").into_response());
      }
    }

    let metadata = fs::metadata(fs_path).await.ok()?;
    if !metadata.is_file() {
      return None;
    }

    if metadata.len() > mount.max_cached_size {
      let stream = FileStream::from_path(fs_path).await.ok()?;
      return Some(stream.into_response());
    }

    let entry = if mount.cache {
      let cell = self
        .entries
        .entry_async(fs_path.to_path_buf())
        .await
        .or_insert_with(|| Arc::new(OnceCell::new()))
        .get()
        .clone();

      let was_filled = cell.initialized();
      let entry = cell
        .get_or_init(|| async { build_entry(fs_path, mount).await })
        .await
        .clone()?;
      let hit_id = if was_filled { ids::CACHE_HIT } else { ids::CACHE_MISS };
      self.events.emit(Signal::new(hit_id)).await;
      entry
    } else {
      self.events.emit(Signal::new(ids::CACHE_MISS)).await;
      build_entry(fs_path, mount).await?
    };

    if let Some(not_modified) = conditional_response(req, &entry, mount) {
      return Some(not_modified);
    }

    let accept_encoding = req
      .headers()
      .get(ACCEPT_ENCODING)
      .and_then(|v| v.to_str().ok())
      .unwrap_or("");
    let (encoding, bytes) = entry.best_for(accept_encoding);

    let mut builder = hyper::Response::builder()
      .status(StatusCode::OK)
      .header(CONTENT_TYPE, entry.mime.as_ref())
      .header(CONTENT_LENGTH, bytes.len().to_string())
      .header(CACHE_CONTROL, format!("public, max-age={}", mount.max_age_seconds))
      .header(VARY, "Accept-Encoding");
    if mount.emit_etag {
      builder = builder.header(ETAG, entry.etag.as_str());
    }
    if mount.emit_last_modified {
      builder = builder.header(LAST_MODIFIED, entry.last_modified_http.as_str());
    }
    if let Some(enc) = encoding {
      builder = builder.header(CONTENT_ENCODING, enc);
    }

    Some(
      builder
        .body(TakoBody::from(bytes.clone()))
        .unwrap_or_else(|e| {
          (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("static cache response error: {e}"),
          )
            .into_response()
        }),
    )
  }
}

impl Default for StaticCache {
  fn default() -> Self {
    Self::new()
  }
}

async fn build_entry(path: &Path, mount: &Mount) -> Option<CacheEntry> {
  let bytes = fs::read(path).await.ok()?;
  let metadata = fs::metadata(path).await.ok()?;
  let last_modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

  let mut hasher = Sha1::new();
  hasher.update(&bytes);
  let etag = format!("\"{:x}\"", hasher.finalize());

  let mime = MimeGuess::from_path(path).first_or_octet_stream();
  let gzip = mount
    .enable_gzip
    .then(|| compress_gzip(&bytes, 6).ok().map(bytes::Bytes::from))
    .flatten();
  let brotli = mount
    .enable_brotli
    .then(|| compress_brotli(&bytes, 5).ok().map(bytes::Bytes::from))
    .flatten();

  Some(CacheEntry {
    mime,
    etag,
    last_modified,
    last_modified_http: httpdate::fmt_http_date(last_modified),
    plain: bytes::Bytes::from(bytes),
    gzip,
    brotli,
  })
}

/// Returns a `304 Not Modified` response if the request's conditional headers indicate
/// the client's cached copy is still fresh. `If-None-Match` takes priority over
/// `If-Modified-Since` per RFC 7232 §6. Either check is skipped entirely when the mount
/// doesn't emit the header the check depends on.
fn conditional_response(req: &Request, entry: &CacheEntry, mount: &Mount) -> Option<Response> {
  if mount.emit_etag
    && let Some(inm) = req.headers().get(IF_NONE_MATCH).and_then(|v| v.to_str().ok())
  {
    let matches = inm
      .split(',')
      .map(|tag| tag.trim())
      .any(|tag| tag == "*" || tag == entry.etag);
    if matches {
      return Some(not_modified(entry, mount));
    }
    return None;
  }

  if mount.emit_last_modified
    && let Some(ims) = req
      .headers()
      .get(IF_MODIFIED_SINCE)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| httpdate::parse_http_date(v).ok())
    && entry.last_modified <= ims
  {
    return Some(not_modified(entry, mount));
  }

  None
}

fn not_modified(entry: &CacheEntry, mount: &Mount) -> Response {
  let mut builder = hyper::Response::builder()
    .status(StatusCode::NOT_MODIFIED)
    .header(CACHE_CONTROL, format!("public, max-age={}", mount.max_age_seconds));
  if mount.emit_etag {
    builder = builder.header(ETAG, entry.etag.as_str());
  }
  if mount.emit_last_modified {
    builder = builder.header(LAST_MODIFIED, entry.last_modified_http.as_str());
  }
  builder.body(TakoBody::empty()).unwrap_or_else(|e| {
    (
      StatusCode::INTERNAL_SERVER_ERROR,
      format!("not-modified response error: {e}"),
    )
      .into_response()
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn write_tmp(name: &str, contents: &[u8]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join(name), contents)
      .await
      .unwrap();
    dir
  }

  fn get(uri: &str) -> Request {
    hyper::Request::builder()
      .uri(uri)
      .body(TakoBody::empty())
      .unwrap()
  }

  #[tokio::test]
  async fn serves_a_cached_file_with_etag() {
    let dir = write_tmp("hello.txt", b"hello world").await;
    let cache = StaticCache::new().mount(Mount::new("/static", dir.path()));

    let resp = cache.handle(&get("/static/hello.txt")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let etag = resp.headers().get(ETAG).unwrap().to_str().unwrap().to_string();

    let mut conditional = get("/static/hello.txt");
    conditional
      .headers_mut()
      .insert(IF_NONE_MATCH, HeaderValue::from_str(&etag).unwrap());
    let resp2 = cache.handle(&conditional).await.unwrap();
    assert_eq!(resp2.status(), StatusCode::NOT_MODIFIED);
  }

  #[tokio::test]
  async fn respects_custom_max_age_and_disabled_etag() {
    let dir = write_tmp("hello.txt", b"hello world").await;
    let cache = StaticCache::new().mount(
      Mount::new("/static", dir.path())
        .with_max_age_seconds(60)
        .with_etag(false),
    );

    let resp = cache.handle(&get("/static/hello.txt")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
      resp.headers().get(CACHE_CONTROL).unwrap().to_str().unwrap(),
      "public, max-age=60"
    );
    assert!(resp.headers().get(ETAG).is_none());
  }

  #[tokio::test]
  async fn blocked_paths_and_extension_allowlist_are_enforced() {
    let dir = write_tmp("secret.pem", b"shh").await;
    let cache = StaticCache::new().mount(
      Mount::new("/static", dir.path()).with_allowed_extensions(["txt"]),
    );
    let resp = cache.handle(&get("/static/secret.pem")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let dir2 = write_tmp("keys.pem", b"shh").await;
    let cache2 = StaticCache::new().mount(
      Mount::new("/static", dir2.path()).with_blocked_paths(["keys.pem"]),
    );
    let resp2 = cache2.handle(&get("/static/keys.pem")).await.unwrap();
    assert_eq!(resp2.status(), StatusCode::FORBIDDEN);
  }

  #[tokio::test]
  async fn without_cache_still_serves_and_disables_compression() {
    let dir = write_tmp("hello.txt", b"hello world").await;
    let cache = StaticCache::new().mount(
      Mount::new("/static", dir.path())
        .without_cache()
        .with_gzip(false)
        .with_brotli(false),
    );

    let mut req = get("/static/hello.txt");
    req
      .headers_mut()
      .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
    let resp = cache.handle(&req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(CONTENT_ENCODING).is_none());
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn symlinked_entries_are_rejected_by_default() {
    let dir = write_tmp("real.txt", b"hello").await;
    let link = dir.path().join("link.txt");
    std::os::unix::fs::symlink(dir.path().join("real.txt"), &link).unwrap();

    let cache = StaticCache::new().mount(Mount::new("/static", dir.path()));
    let resp = cache.handle(&get("/static/link.txt")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let cache2 = StaticCache::new().mount(Mount::new("/static", dir.path()).allowing_system());
    let resp2 = cache2.handle(&get("/static/link.txt")).await.unwrap();
    assert_eq!(resp2.status(), StatusCode::OK);
  }

  #[tokio::test]
  async fn falls_through_when_no_mount_prefix_matches() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StaticCache::new().mount(Mount::new("/static", dir.path()));
    assert!(cache.handle(&get("/api/users")).await.is_none());
  }

  #[test]
  fn mount_resolves_nested_paths_and_rejects_traversal() {
    let mount = Mount::new("/static", "/srv/www");
    assert_eq!(
      mount.resolve("css/app.css"),
      Some(PathBuf::from("/srv/www/css/app.css"))
    );
    assert_eq!(mount.resolve("../secret"), None);
    assert_eq!(mount.resolve(""), Some(PathBuf::from("/srv/www")));
  }

  #[test]
  fn strip_prefix_handles_trailing_slash_variants() {
    let mount = Mount::new("/static", "/srv/www");
    assert_eq!(mount.strip_prefix("/static/app.js"), Some("app.js"));
    assert_eq!(mount.strip_prefix("/other/app.js"), None);
  }

  #[tokio::test]
  async fn cache_entry_picks_best_encoding() {
    let entry = build_entry_for_test(b"x".repeat(4096).as_slice()).await;
    let (enc, _) = entry.best_for("gzip, br");
    assert_eq!(enc, Some("br"));
    let (enc, _) = entry.best_for("gzip");
    assert_eq!(enc, Some("gzip"));
    let (enc, bytes) = entry.best_for("identity");
    assert_eq!(enc, None);
    assert_eq!(bytes.len(), 4096);
  }

  async fn build_entry_for_test(data: &[u8]) -> CacheEntry {
    let dir = write_tmp("f.bin", data).await;
    let mount = Mount::new("/static", dir.path());
    build_entry(&dir.path().join("f.bin"), &mount).await.unwrap()
  }
}
