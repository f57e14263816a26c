// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! Resolution of import specifiers to locators. Relative and absolute
//! specifiers resolve against the parent locator with plain URL arithmetic.
//! Bare specifiers are treated as package names and resolved the Node way:
//! walk the ancestor directories of the parent looking for
//! `node_modules/<package>/package.json`, then interpret the manifest's
//! `exports` (or `module`/`main`) to find the file backing the subpath.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::errors::RepleteError;
use crate::locators;
use crate::locators::SpecifierKind;

/// The `package.json` fields recognized during resolution.
#[derive(Debug, Default, Deserialize)]
struct PackageManifest {
  main: Option<String>,
  module: Option<String>,
  exports: Option<Value>,
}

/// Map a specifier and the locator of the module containing it to the
/// locator of the imported module. Deterministic for a fixed filesystem.
pub async fn locate(
  specifier: &str,
  parent: &Url,
) -> Result<Url, RepleteError> {
  match locators::classify(specifier) {
    SpecifierKind::Builtin => {
      let name = specifier.strip_prefix("node:").unwrap_or(specifier);
      Ok(
        Url::parse(&format!("{}:{}", locators::BUILTIN_SCHEME, name))
          .map_err(|_| malformed(specifier, parent))?,
      )
    }
    SpecifierKind::FullyQualified => {
      Url::parse(specifier).map_err(|_| malformed(specifier, parent))
    }
    SpecifierKind::Relative | SpecifierKind::AbsolutePath => {
      parent.join(specifier).map_err(|_| malformed(specifier, parent))
    }
    SpecifierKind::Bare => locate_bare(specifier, parent).await,
  }
}

fn malformed(specifier: &str, parent: &Url) -> RepleteError {
  RepleteError::PackageNotFound {
    specifier: specifier.to_owned(),
    parent: parent.to_string(),
  }
}

/// Split a bare specifier into the package name and the `.`-prefixed
/// subpath. Scoped packages take two segments.
fn split_package_specifier(specifier: &str) -> (String, String) {
  let segment_count = if specifier.starts_with('@') { 2 } else { 1 };
  let mut indices = specifier.match_indices('/').skip(segment_count - 1);
  match indices.next() {
    Some((index, _)) => (
      specifier[..index].to_owned(),
      format!(".{}", &specifier[index..]),
    ),
    None => (specifier.to_owned(), ".".to_owned()),
  }
}

async fn locate_bare(
  specifier: &str,
  parent: &Url,
) -> Result<Url, RepleteError> {
  let (package_name, subpath) = split_package_specifier(specifier);
  let parent_path = parent
    .to_file_path()
    .map_err(|_| malformed(specifier, parent))?;
  let mut directory: &Path = parent_path
    .parent()
    .ok_or_else(|| malformed(specifier, parent))?;
  let manifest_path = loop {
    let candidate = directory
      .join("node_modules")
      .join(&package_name)
      .join("package.json");
    if tokio::fs::metadata(&candidate).await.is_ok() {
      break candidate;
    }
    directory = match directory.parent() {
      Some(parent_directory) => parent_directory,
      None => {
        return Err(RepleteError::PackageNotFound {
          specifier: specifier.to_owned(),
          parent: parent.to_string(),
        });
      }
    };
  };
  let manifest_text = tokio::fs::read_to_string(&manifest_path)
    .await
    .map_err(|io_error| RepleteError::ReadFailed {
      locator: manifest_path.display().to_string(),
      message: io_error.to_string(),
    })?;
  let manifest: PackageManifest = serde_json::from_str(&manifest_text)
    .unwrap_or_default();
  let target = resolve_subpath(&manifest, &subpath).ok_or_else(|| {
    RepleteError::NotExported {
      specifier: specifier.to_owned(),
      parent: parent.to_string(),
    }
  })?;
  let manifest_url = Url::from_file_path(&manifest_path)
    .map_err(|_| malformed(specifier, parent))?;
  let resolved = manifest_url
    .join(&target)
    .map_err(|_| malformed(specifier, parent))?;
  Ok(canonicalize(resolved).await)
}

/// Follow filesystem symlinks to a canonical file URL. If canonicalization
/// fails the non-canonical URL is returned.
async fn canonicalize(locator: Url) -> Url {
  let Ok(path) = locator.to_file_path() else {
    return locator;
  };
  match tokio::fs::canonicalize(&path).await {
    Ok(canonical) => Url::from_file_path(&canonical).unwrap_or(locator),
    Err(_) => locator,
  }
}

/// Find the relative path exported for `subpath`, or `None` if the package
/// does not export it.
fn resolve_subpath(
  manifest: &PackageManifest,
  subpath: &str,
) -> Option<String> {
  match &manifest.exports {
    Some(exports) => {
      let target = lookup_exports(exports, subpath)?;
      let conditional = unwrap_conditions(&target)?;
      if let Some(captured) = target_capture(exports, subpath) {
        Some(substitute_glob(&conditional, &captured))
      } else {
        Some(conditional)
      }
    }
    None if subpath == "." => Some(
      manifest
        .module
        .clone()
        .or_else(|| manifest.main.clone())
        .unwrap_or_else(|| "./index.js".to_owned()),
    ),
    None => Some(subpath.to_owned()),
  }
}

/// Whether `exports` is a subpath table, i.e. an object whose keys are `.`
/// or `./…` paths rather than condition names.
fn is_subpath_table(exports: &Value) -> bool {
  exports
    .as_object()
    .is_some_and(|map| map.keys().any(|key| key.starts_with('.')))
}

fn lookup_exports(exports: &Value, subpath: &str) -> Option<Value> {
  if !is_subpath_table(exports) {
    return if subpath == "." {
      Some(exports.clone())
    } else {
      None
    };
  }
  let map = exports.as_object()?;
  if let Some(exact) = map.get(subpath) {
    return Some(exact.clone());
  }
  map.iter().find_map(|(key, value)| {
    glob_capture(key, subpath).map(|_| value.clone())
  })
}

/// The middle captured by the matching glob key, if the lookup went through
/// one.
fn target_capture(exports: &Value, subpath: &str) -> Option<String> {
  let map = exports.as_object()?;
  if map.contains_key(subpath) {
    return None;
  }
  map
    .keys()
    .find_map(|key| glob_capture(key, subpath))
}

/// Match `subpath` against a key containing exactly one `*`, returning the
/// captured middle.
fn glob_capture(key: &str, subpath: &str) -> Option<String> {
  let (prefix, suffix) = key.split_once('*')?;
  if suffix.contains('*') {
    return None;
  }
  if subpath.len() < prefix.len() + suffix.len() {
    return None;
  }
  if subpath.starts_with(prefix) && subpath.ends_with(suffix) {
    Some(subpath[prefix.len()..subpath.len() - suffix.len()].to_owned())
  } else {
    None
  }
}

fn substitute_glob(target: &str, captured: &str) -> String {
  match target.split_once('*') {
    Some((prefix, suffix)) => format!("{}{}{}", prefix, captured, suffix),
    None => target.to_owned(),
  }
}

/// Unwrap a conditional export. Recognized conditions, in priority order:
/// `import`, `module`, `default`. Arrays unwrap to their first element. A
/// value of any other shape means the subpath is not exported.
fn unwrap_conditions(value: &Value) -> Option<String> {
  match value {
    Value::String(target) => Some(target.clone()),
    Value::Array(values) => unwrap_conditions(values.first()?),
    Value::Object(map) => ["import", "module", "default"]
      .iter()
      .find_map(|condition| map.get(*condition))
      .and_then(unwrap_conditions),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn write_manifest(directory: &Path, package: &str, json: &str) {
    let package_directory = directory.join("node_modules").join(package);
    tokio::fs::create_dir_all(&package_directory).await.unwrap();
    tokio::fs::write(package_directory.join("package.json"), json)
      .await
      .unwrap();
  }

  #[test]
  fn test_split_package_specifier() {
    assert_eq!(
      split_package_specifier("exports"),
      ("exports".to_owned(), ".".to_owned())
    );
    assert_eq!(
      split_package_specifier("exports/wildcard/img.svg"),
      ("exports".to_owned(), "./wildcard/img.svg".to_owned())
    );
    assert_eq!(
      split_package_specifier("@scope/pkg"),
      ("@scope/pkg".to_owned(), ".".to_owned())
    );
    assert_eq!(
      split_package_specifier("@scope/pkg/deep/file.js"),
      ("@scope/pkg".to_owned(), "./deep/file.js".to_owned())
    );
  }

  #[tokio::test]
  async fn test_locate_relative() {
    let parent = Url::parse("file:///a/b/c.js").unwrap();
    assert_eq!(
      locate("./d.js", &parent).await.unwrap().as_str(),
      "file:///a/b/d.js"
    );
    assert_eq!(
      locate("../d.js", &parent).await.unwrap().as_str(),
      "file:///a/d.js"
    );
    assert_eq!(
      locate("/d.js", &parent).await.unwrap().as_str(),
      "file:///d.js"
    );
  }

  #[tokio::test]
  async fn test_locate_builtin() {
    let parent = Url::parse("file:///a/b.js").unwrap();
    assert_eq!(
      locate("path", &parent).await.unwrap().as_str(),
      "node:path"
    );
    assert_eq!(
      locate("node:path", &parent).await.unwrap().as_str(),
      "node:path"
    );
  }

  #[tokio::test]
  async fn test_locate_conditional_export() {
    let root = tempfile::tempdir().unwrap();
    let a = root.path().join("a");
    tokio::fs::create_dir_all(&a).await.unwrap();
    write_manifest(
      &a,
      "exports",
      r#"{
        "exports": {
          ".": {
            "import": "./dist/import_default.js",
            "require": "./dist/require.js"
          }
        }
      }"#,
    )
    .await;
    let parent = Url::from_file_path(a.join("b.js")).unwrap();
    let located = locate("exports", &parent).await.unwrap();
    assert!(
      located
        .path()
        .ends_with("/a/node_modules/exports/dist/import_default.js"),
      "unexpected locator: {}",
      located
    );
  }

  #[tokio::test]
  async fn test_locate_glob_export() {
    let root = tempfile::tempdir().unwrap();
    let a = root.path().join("a");
    tokio::fs::create_dir_all(&a).await.unwrap();
    write_manifest(
      &a,
      "exports",
      r#"{
        "exports": {
          "./wildcard/*": "./dist/wildcard/*",
          "./wildcard_ext/*.js": "./dist/wildcard_ext/*.js"
        }
      }"#,
    )
    .await;
    let parent = Url::from_file_path(a.join("b.js")).unwrap();
    let located = locate("exports/wildcard/img.svg", &parent).await.unwrap();
    assert!(
      located.path().ends_with("/dist/wildcard/img.svg"),
      "unexpected locator: {}",
      located
    );
    let located =
      locate("exports/wildcard_ext/img.js", &parent).await.unwrap();
    assert!(located.path().ends_with("/dist/wildcard_ext/img.js"));
    let error = locate("exports/wildcard_ext/img.wrongext", &parent)
      .await
      .unwrap_err();
    assert_eq!(error.code(), "notExported");
  }

  #[tokio::test]
  async fn test_locate_walks_ancestors() {
    let root = tempfile::tempdir().unwrap();
    let deep = root.path().join("a").join("b").join("c");
    tokio::fs::create_dir_all(&deep).await.unwrap();
    write_manifest(&deep, "nested", r#"{"main": "./main.js"}"#).await;
    let far_parent =
      Url::from_file_path(root.path().join("a").join("b.js")).unwrap();
    let error = locate("nested", &far_parent).await.unwrap_err();
    assert_eq!(error.code(), "packageNotFound");
    let near_parent = Url::from_file_path(deep.join("d.js")).unwrap();
    let located = locate("nested", &near_parent).await.unwrap();
    assert!(located.path().ends_with("/node_modules/nested/main.js"));
  }

  #[tokio::test]
  async fn test_locate_fallbacks() {
    let root = tempfile::tempdir().unwrap();
    let base = root.path().to_path_buf();
    write_manifest(&base, "mainless", r#"{}"#).await;
    write_manifest(&base, "moduleful", r#"{"module": "./m.mjs", "main": "./m.cjs"}"#)
      .await;
    let parent = Url::from_file_path(base.join("x.js")).unwrap();
    let located = locate("mainless", &parent).await.unwrap();
    assert!(located.path().ends_with("/node_modules/mainless/index.js"));
    let located = locate("moduleful", &parent).await.unwrap();
    assert!(located.path().ends_with("/node_modules/moduleful/m.mjs"));
    // Subpaths resolve verbatim when `exports` is absent.
    let located = locate("mainless/lib/util.js", &parent).await.unwrap();
    assert!(located.path().ends_with("/node_modules/mainless/lib/util.js"));
  }

  #[test]
  fn test_unwrap_conditions() {
    let conditional: Value = serde_json::json!({
      "require": "./r.js",
      "module": "./m.js",
      "default": "./d.js"
    });
    assert_eq!(unwrap_conditions(&conditional), Some("./m.js".to_owned()));
    let nested: Value = serde_json::json!({
      "import": ["./first.js", "./second.js"]
    });
    assert_eq!(unwrap_conditions(&nested), Some("./first.js".to_owned()));
    assert_eq!(unwrap_conditions(&serde_json::json!({"require": "./r.js"})), None);
    assert_eq!(unwrap_conditions(&serde_json::json!(null)), None);
  }
}
