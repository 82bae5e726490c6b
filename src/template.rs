//! Server-rendered template facade.
//!
//! Wraps [`handlebars`] behind a small [`TemplateEngine`] that loads every template
//! matching a glob under a directory once at startup (or on an explicit [`TemplateEngine::reload`]
//! in development) and renders by name thereafter. Kept deliberately thin: Tako doesn't
//! prescribe a templating language, this is the one the ecosystem reaches for most often
//! when nothing else is already in play.

use std::{path::Path, sync::RwLock};

use handlebars::Handlebars;
use http::StatusCode;
use serde::Serialize;

use crate::{responder::Responder, types::Response};

/// Failure modes for loading or rendering a template.
#[derive(Debug)]
pub enum TemplateError {
  /// `glob` failed to walk the template directory.
  Glob(glob::PatternError),
  /// A matched path couldn't be read or registered.
  Load { path: String, source: handlebars::TemplateError },
  /// `render` was called with a name nothing was registered under.
  NotFound(String),
  /// Handlebars failed mid-render (missing context field, helper error, etc).
  Render(handlebars::RenderError),
}

impl std::fmt::Display for TemplateError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TemplateError::Glob(err) => write!(f, "invalid template glob: {err}"),
      TemplateError::Load { path, source } => write!(f, "failed to load template {path}: {source}"),
      TemplateError::NotFound(name) => write!(f, "no template registered under {name:?}"),
      TemplateError::Render(err) => write!(f, "template render error: {err}"),
    }
  }
}

impl std::error::Error for TemplateError {}

impl Responder for TemplateError {
  fn into_response(self) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
  }
}

/// A successfully rendered template, ready to serve as `text/html`.
pub struct Rendered(pub String);

impl Responder for Rendered {
  fn into_response(self) -> Response {
    let mut resp = (StatusCode::OK, self.0).into_response();
    resp.headers_mut().insert(
      http::header::CONTENT_TYPE,
      http::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    resp
  }
}

/// Thin facade over a [`Handlebars`] registry.
///
/// Template names are derived from their path relative to the loaded directory with the
/// extension stripped and `std::path::MAIN_SEPARATOR` normalized to `/`, so
/// `views/users/show.hbs` registers as `users/show`.
pub struct TemplateEngine {
  registry: RwLock<Handlebars<'static>>,
}

impl Default for TemplateEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl TemplateEngine {
  /// Creates an empty engine. Handlebars' default strict mode is left off, matching its
  /// own default (missing context fields render empty rather than erroring); call
  /// [`TemplateEngine::set_strict`] to opt into strict mode.
  pub fn new() -> Self {
    Self {
      registry: RwLock::new(Handlebars::new()),
    }
  }

  /// Toggles Handlebars' strict mode, where referencing a missing context field is a
  /// render error instead of rendering as empty.
  pub fn set_strict(&self, strict: bool) {
    self.registry.write().unwrap().set_strict_mode(strict);
  }

  /// Loads every file under `dir` matching `glob_pattern` (e.g. `"**/*.hbs"`), registering
  /// each under a name derived from its path relative to `dir`. Returns the number of
  /// templates loaded.
  pub fn load_dir(&self, dir: impl AsRef<Path>, glob_pattern: &str) -> Result<usize, TemplateError> {
    let dir = dir.as_ref();
    let full_pattern = dir.join(glob_pattern);
    let paths = glob::glob(&full_pattern.to_string_lossy()).map_err(TemplateError::Glob)?;

    let mut loaded = 0;
    for entry in paths {
      let Ok(path) = entry else { continue };
      if !path.is_file() {
        continue;
      }
      let name = template_name(dir, &path);
      self.register_file(&name, &path)?;
      loaded += 1;
    }
    Ok(loaded)
  }

  /// Registers a single file under `name`.
  pub fn register_file(&self, name: &str, path: &Path) -> Result<(), TemplateError> {
    self
      .registry
      .write()
      .unwrap()
      .register_template_file(name, path)
      .map_err(|source| TemplateError::Load {
        path: path.display().to_string(),
        source,
      })
  }

  /// Registers a template from an in-memory source string, overwriting any previous
  /// registration under the same name. Useful for tests and for templates generated at
  /// runtime rather than loaded from disk.
  pub fn register_str(&self, name: &str, source: &str) -> Result<(), TemplateError> {
    self
      .registry
      .write()
      .unwrap()
      .register_template_string(name, source)
      .map_err(|source| TemplateError::Load {
        path: name.to_string(),
        source,
      })
  }

  /// Clears every registered template. Paired with [`TemplateEngine::load_dir`] this
  /// gives a simple hot-reload for development: flush, then reload the directory.
  pub fn reload(&self, dir: impl AsRef<Path>, glob_pattern: &str) -> Result<usize, TemplateError> {
    self.registry.write().unwrap().clear_templates();
    self.load_dir(dir, glob_pattern)
  }

  /// Renders the template registered under `name` with `context` serialized to JSON.
  pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<Rendered, TemplateError> {
    let registry = self.registry.read().unwrap();
    if !registry.has_template(name) {
      return Err(TemplateError::NotFound(name.to_string()));
    }
    registry
      .render(name, context)
      .map(Rendered)
      .map_err(TemplateError::Render)
  }

  /// Names of every currently registered template.
  pub fn template_names(&self) -> Vec<String> {
    self.registry.read().unwrap().get_templates().keys().cloned().collect()
  }
}

fn template_name(root: &Path, path: &Path) -> String {
  let relative = path.strip_prefix(root).unwrap_or(path);
  let mut relative = relative.to_path_buf();
  relative.set_extension("");
  relative.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/")
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn renders_registered_template_with_context() {
    let engine = TemplateEngine::new();
    engine.register_str("greeting", "Hello, {{name}}!").unwrap();

    let rendered = engine.render("greeting", &json!({ "name": "Ferris" })).unwrap();
    assert_eq!(rendered.0, "Hello, Ferris!");
  }

  #[test]
  fn rendering_unknown_template_is_an_error() {
    let engine = TemplateEngine::new();
    let err = engine.render("missing", &json!({})).unwrap_err();
    assert!(matches!(err, TemplateError::NotFound(name) if name == "missing"));
  }

  #[test]
  fn reregistering_a_name_overwrites_the_previous_source() {
    let engine = TemplateEngine::new();
    engine.register_str("page", "v1").unwrap();
    engine.register_str("page", "v2").unwrap();

    let rendered = engine.render("page", &json!({})).unwrap();
    assert_eq!(rendered.0, "v2");
  }

  #[test]
  fn template_name_strips_extension_and_normalizes_separators() {
    let root = Path::new("/views");
    let path = Path::new("/views/users/show.hbs");
    assert_eq!(template_name(root, path), "users/show");
  }
}
