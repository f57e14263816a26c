// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! The capability set a host supplies to the core. The production
//! implementation reads beneath a root directory and watches it for changes;
//! tests substitute in-memory implementations.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use notify::Watcher;
use notify::event::EventKind;
use tokio::sync::oneshot;
use url::Url;

use crate::errors::RepleteError;
use crate::locators;
use crate::node_resolver;
use crate::repl::EvalRequest;

#[async_trait]
pub trait Capabilities: Send + Sync {
  /// Rewrite an evaluation request before it is processed.
  fn command(&self, request: EvalRequest) -> Result<EvalRequest, RepleteError> {
    Ok(request)
  }

  /// Map a specifier and the locator of the module containing it to the
  /// locator of the imported module.
  async fn locate(
    &self,
    specifier: &str,
    parent: &Url,
  ) -> Result<Url, RepleteError> {
    node_resolver::locate(specifier, parent).await
  }

  /// Read the resource identified by a locator.
  async fn read(&self, locator: &Url) -> Result<Bytes, RepleteError>;

  /// Fulfill on the next change to the resource identified by a locator.
  async fn watch(&self, locator: &Url) -> Result<(), RepleteError>;

  /// The content type of the resource, or `None` if it is unknown.
  fn mime(&self, locator: &Url) -> Option<String> {
    default_mime(locator)
  }

  /// Convert a (possibly versioned) locator into the URL the padawan will
  /// request it by.
  fn specify(&self, locator: &Url, server_origin: &str) -> String {
    if locator.scheme() == "file" {
      format!("{}{}", server_origin, locator.path())
    } else {
      locator.to_string()
    }
  }

  /// Deliver side band output produced by a padawan.
  fn out(&self, text: &str);
  fn err(&self, text: &str);
}

pub fn default_mime(locator: &Url) -> Option<String> {
  if locators::is_js(locator) {
    return Some("text/javascript".to_owned());
  }
  let extension = locator.path().rsplit_once('.')?.1.to_ascii_lowercase();
  let mime = match extension.as_str() {
    "html" | "htm" => "text/html",
    "css" => "text/css",
    "json" | "map" => "application/json",
    "svg" => "image/svg+xml",
    "png" => "image/png",
    "gif" => "image/gif",
    "jpg" | "jpeg" => "image/jpeg",
    "webp" => "image/webp",
    "woff" => "font/woff",
    "woff2" => "font/woff2",
    "wasm" => "application/wasm",
    "txt" => "text/plain",
    "md" => "text/markdown",
    _ => return None,
  };
  Some(mime.to_owned())
}

/// Waiters are completed from the notify thread the first time the watched
/// path changes.
type Waiters = Arc<Mutex<HashMap<PathBuf, Vec<oneshot::Sender<()>>>>>;

pub struct FileWatcher {
  _watcher: Mutex<notify::RecommendedWatcher>,
  waiters: Waiters,
}

impl FileWatcher {
  pub fn new(root: &Path) -> Result<Self, notify::Error> {
    let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
    let callback_waiters = waiters.clone();
    let mut watcher = notify::recommended_watcher(
      move |result: Result<notify::Event, notify::Error>| {
        let Ok(event) = result else {
          return;
        };
        if !matches!(
          event.kind,
          EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
          return;
        }
        for path in event.paths {
          let senders = callback_waiters
            .lock()
            .unwrap()
            .remove(&path)
            .unwrap_or_default();
          for sender in senders {
            let _ = sender.send(());
          }
        }
      },
    )?;
    watcher.watch(root, notify::RecursiveMode::Recursive)?;
    Ok(Self {
      _watcher: Mutex::new(watcher),
      waiters,
    })
  }

  pub async fn next_change(&self, path: PathBuf) -> Result<(), RepleteError> {
    let (sender, receiver) = oneshot::channel();
    self
      .waiters
      .lock()
      .unwrap()
      .entry(path)
      .or_default()
      .push(sender);
    receiver
      .await
      .map_err(|_| RepleteError::InternalServerError)
  }
}

/// The filesystem-backed capability set used when Replete runs standalone.
pub struct FsCapabilities {
  root: Url,
  watcher: FileWatcher,
}

impl FsCapabilities {
  pub fn new(root: Url) -> Result<Self, RepleteError> {
    let root_path = root
      .to_file_path()
      .map_err(|_| RepleteError::MalformedRequest {
        msg: "the root locator is not a file URL".into(),
      })?;
    let watcher = FileWatcher::new(&root_path)
      .map_err(|error| anyhow::anyhow!("failed to watch root: {error}"))?;
    Ok(Self { root, watcher })
  }

  pub fn root(&self) -> &Url {
    &self.root
  }

  fn file_path(&self, locator: &Url) -> Result<PathBuf, RepleteError> {
    if !locator.as_str().starts_with(self.root.as_str()) {
      return Err(RepleteError::Forbidden {
        locator: locator.to_string(),
      });
    }
    locator
      .to_file_path()
      .map_err(|_| RepleteError::Forbidden {
        locator: locator.to_string(),
      })
  }
}

#[async_trait]
impl Capabilities for FsCapabilities {
  async fn read(&self, locator: &Url) -> Result<Bytes, RepleteError> {
    let path = self.file_path(locator)?;
    match tokio::fs::read(&path).await {
      Ok(bytes) => Ok(Bytes::from(bytes)),
      Err(error) => Err(RepleteError::ReadFailed {
        locator: locator.to_string(),
        message: error.to_string(),
      }),
    }
  }

  async fn watch(&self, locator: &Url) -> Result<(), RepleteError> {
    let path = self.file_path(locator)?;
    // Change notifications carry real paths, so watch the real path.
    let path = tokio::fs::canonicalize(&path).await.unwrap_or(path);
    self.watcher.next_change(path).await
  }

  fn out(&self, text: &str) {
    eprint!("{}", text);
  }

  fn err(&self, text: &str) {
    eprint!("{}", text);
  }
}
