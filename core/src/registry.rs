// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! The fingerprint and version registry. Each file-backed JavaScript module
//! gets a hash derived from its own source and the hashes of its
//! dependencies, and a version number that bumps by one whenever the hash
//! changes. Versions only ever increase, which is what defeats the
//! runtime's immutable module cache: a changed module graph yields fresh
//! versioned locators that the runtime has never seen.
//!
//! Reads and analyses are memoized per locator with single-flight caches,
//! so a parallel traversal of the dependency graph reads every file once.
//! Failures are never cached.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use url::Url;

use crate::analyze;
use crate::analyze::ModuleAnalysis;
use crate::capabilities::Capabilities;
use crate::errors::RepleteError;
use crate::locators;

const CACHE_CAPACITY: u64 = 16_384;

struct VersionEntry {
  version: u64,
  last_hash: String,
}

struct Inner {
  token: String,
  capabilities: Arc<dyn Capabilities>,
  sources: moka::future::Cache<Url, Bytes>,
  analyses: moka::future::Cache<Url, Arc<ModuleAnalysis>>,
  // Resolution depends only on filesystem topology, so it is never
  // invalidated.
  locations: moka::future::Cache<(String, Url), Url>,
  hashes: Mutex<HashMap<Url, String>>,
  versions: Mutex<HashMap<Url, VersionEntry>>,
}

#[derive(Clone)]
pub struct Registry {
  inner: Arc<Inner>,
}

impl Registry {
  pub fn new(capabilities: Arc<dyn Capabilities>) -> Self {
    Self {
      inner: Arc::new(Inner {
        token: locators::unguessable(),
        capabilities,
        sources: moka::future::Cache::new(CACHE_CAPACITY),
        analyses: moka::future::Cache::new(CACHE_CAPACITY),
        locations: moka::future::Cache::new(CACHE_CAPACITY),
        hashes: Mutex::new(HashMap::new()),
        versions: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// The token that demarcates versioning information from user paths in
  /// versioned locators.
  pub fn token(&self) -> &str {
    &self.inner.token
  }

  pub async fn read(&self, locator: &Url) -> Result<Bytes, RepleteError> {
    let registry = self.clone();
    let key = locator.clone();
    self
      .inner
      .sources
      .try_get_with(locator.clone(), async move {
        let bytes = registry.inner.capabilities.read(&key).await?;
        registry.watch_for_changes(key);
        Ok::<Bytes, RepleteError>(bytes)
      })
      .await
      .map_err(unshare)
  }

  pub async fn read_text(&self, locator: &Url) -> Result<String, RepleteError> {
    let bytes = self.read(locator).await?;
    String::from_utf8(bytes.to_vec()).map_err(|_| RepleteError::ReadFailed {
      locator: locator.to_string(),
      message: "not valid UTF-8".to_owned(),
    })
  }

  pub async fn analysis(
    &self,
    locator: &Url,
  ) -> Result<Arc<ModuleAnalysis>, RepleteError> {
    let registry = self.clone();
    let key = locator.clone();
    self
      .inner
      .analyses
      .try_get_with(locator.clone(), async move {
        let text = registry.read_text(&key).await?;
        let parsed = analyze::parse(&key, &text)?;
        Ok::<Arc<ModuleAnalysis>, RepleteError>(Arc::new(analyze::analyze(
          &parsed,
        )))
      })
      .await
      .map_err(unshare)
  }

  pub async fn locate(
    &self,
    specifier: &str,
    parent: &Url,
  ) -> Result<Url, RepleteError> {
    let capabilities = self.inner.capabilities.clone();
    let owned_specifier = specifier.to_owned();
    let owned_parent = parent.clone();
    self
      .inner
      .locations
      .try_get_with((specifier.to_owned(), parent.clone()), async move {
        capabilities.locate(&owned_specifier, &owned_parent).await
      })
      .await
      .map_err(unshare)
  }

  /// The recursive content and dependency hash, or `None` when the locator
  /// is not a file-backed JavaScript module.
  pub async fn hash(
    &self,
    locator: &Url,
  ) -> Result<Option<String>, RepleteError> {
    if locator.scheme() != "file" || !locators::is_js(locator) {
      return Ok(None);
    }
    let mut visiting = HashSet::new();
    self.hash_file(locator.clone(), &mut visiting).await.map(Some)
  }

  fn hash_file<'a>(
    &'a self,
    locator: Url,
    visiting: &'a mut HashSet<Url>,
  ) -> BoxFuture<'a, Result<String, RepleteError>> {
    async move {
      if let Some(known) = self.inner.hashes.lock().unwrap().get(&locator) {
        return Ok(known.clone());
      }
      if !visiting.insert(locator.clone()) {
        // A module in a cycle contributes a fixed sentinel rather than
        // recursing forever.
        return Ok(locators::hash("cycle"));
      }
      let text = self.read_text(&locator).await?;
      let analysis = self.analysis(&locator).await?;
      let mut parts = vec![locators::hash(&text)];
      for (_, specifier) in analysis.specifiers() {
        let dependency = self.locate(&specifier, &locator).await?;
        if dependency.scheme() == "file" && locators::is_js(&dependency) {
          parts.push(self.hash_file(dependency, &mut *visiting).await?);
        }
      }
      let combined = locators::hash(&parts.join("\n"));
      self
        .inner
        .hashes
        .lock()
        .unwrap()
        .insert(locator, combined.clone());
      Ok(combined)
    }
    .boxed()
  }

  /// The current version of a locator. Versions start at 0 and bump by one
  /// whenever the hash changes; they never decrease.
  pub async fn version(&self, locator: &Url) -> Result<u64, RepleteError> {
    let Some(current) = self.hash(locator).await? else {
      return Ok(0);
    };
    let mut versions = self.inner.versions.lock().unwrap();
    let entry =
      versions
        .entry(locator.clone())
        .or_insert_with(|| VersionEntry {
          version: 0,
          last_hash: current.clone(),
        });
    if entry.last_hash != current {
      entry.version += 1;
      entry.last_hash = current;
    }
    Ok(entry.version)
  }

  pub async fn versionize(&self, locator: &Url) -> Result<Url, RepleteError> {
    if locator.scheme() != "file" || !locators::is_js(locator) {
      return Ok(locator.clone());
    }
    let version = self.version(locator).await?;
    Ok(locators::versionize(locator, version, &self.inner.token))
  }

  /// Invalidate everything derived from a file: its cached source and
  /// analysis, and every hash, since any hash may depend on the changed
  /// file through the dependency graph.
  pub async fn file_changed(&self, locator: &Url) {
    self.inner.sources.invalidate(locator).await;
    self.inner.analyses.invalidate(locator).await;
    self.inner.hashes.lock().unwrap().clear();
  }

  fn watch_for_changes(&self, locator: Url) {
    let registry = self.clone();
    tokio::spawn(async move {
      if let Err(error) =
        registry.inner.capabilities.watch(&locator).await
      {
        tracing::warn!("watch failed for {}: {}", locator, error);
      }
      // On a change the entry is refreshed on next use. On a watch failure
      // it is dropped immediately, keeping the locator uncacheable so
      // freshness wins over throughput.
      registry.file_changed(&locator).await;
    });
  }
}

fn unshare(error: Arc<RepleteError>) -> RepleteError {
  (*error).clone()
}
