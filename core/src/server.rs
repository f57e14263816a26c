// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! The source server. Padawans import their modules over HTTP: each request
//! for a JavaScript file is answered with the source text whose import
//! specifiers have been resolved and versionized, so that the runtime's
//! module cache is defeated exactly when content changes. Non-JavaScript
//! assets are served verbatim.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use hyper::Body;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::header;
use routerify::Router;
use routerify::RouterService;
use routerify::prelude::RequestExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use crate::analyze::ExportSite;
use crate::analyze::ModuleAnalysis;
use crate::capabilities::Capabilities;
use crate::errors::RepleteError;
use crate::errors_internal::error_handler;
use crate::locators;
use crate::registry::Registry;
use crate::rewrite::Alteration;
use crate::rewrite::alter_string;

#[derive(Clone)]
pub struct ServerState {
  pub registry: Registry,
  pub capabilities: Arc<dyn Capabilities>,
}

pub struct SourceServer {
  origin: String,
  port: u16,
  shutdown: Mutex<Option<oneshot::Sender<()>>>,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl SourceServer {
  /// Bind the loopback listener and start serving. A `port` of 0 picks an
  /// ephemeral port.
  pub async fn start(
    registry: Registry,
    capabilities: Arc<dyn Capabilities>,
    port: u16,
  ) -> Result<SourceServer, RepleteError> {
    let state = ServerState {
      registry,
      capabilities,
    };
    let router: Router<Body, RepleteError> = Router::builder()
      .data(state)
      .any(source_handler)
      .err_handler_with_info(error_handler)
      .build()
      .map_err(|error| anyhow::anyhow!("router: {error}"))?;
    let service = RouterService::new(router)
      .map_err(|error| anyhow::anyhow!("router service: {error}"))?;
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let server = hyper::Server::try_bind(&address)?.serve(service);
    let local_address = server.local_addr();
    let (shutdown_sender, shutdown_receiver) = oneshot::channel();
    let graceful = server.with_graceful_shutdown(async {
      shutdown_receiver.await.ok();
    });
    let task = tokio::spawn(async move {
      if let Err(error) = graceful.await {
        tracing::error!("source server error: {}", error);
      }
    });
    tracing::debug!("source server listening on {}", local_address);
    Ok(SourceServer {
      origin: format!("http://{}", local_address),
      port: local_address.port(),
      shutdown: Mutex::new(Some(shutdown_sender)),
      task: Mutex::new(Some(task)),
    })
  }

  pub fn origin(&self) -> &str {
    &self.origin
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// Idempotent.
  pub async fn stop(&self) {
    if let Some(sender) = self.shutdown.lock().unwrap().take() {
      let _ = sender.send(());
    }
    let task = self.task.lock().unwrap().take();
    if let Some(task) = task {
      let _ = task.await;
    }
  }
}

async fn source_handler(
  request: Request<Body>,
) -> Result<Response<Body>, RepleteError> {
  let state = request
    .data::<ServerState>()
    .expect("server state is always attached")
    .clone();
  let origin = request
    .headers()
    .get(header::ORIGIN)
    .and_then(|value| value.to_str().ok())
    .map(str::to_owned);
  serve(&state, request.uri().path(), origin.as_deref()).await
}

/// Answer one request for `path`, which may carry a `/v<N>/<token>/`
/// version prefix.
pub async fn serve(
  state: &ServerState,
  path: &str,
  origin: Option<&str>,
) -> Result<Response<Body>, RepleteError> {
  let decoded = percent_encoding::percent_decode_str(path)
    .decode_utf8()
    .map_err(|_| RepleteError::NotFound)?;
  let file_path =
    match locators::deversionize(&decoded, state.registry.token()) {
      Some((_version, original)) => original,
      None => decoded.into_owned(),
    };
  let locator = Url::from_file_path(std::path::Path::new(&file_path))
    .map_err(|_| RepleteError::NotFound)?;
  let mime = state.capabilities.mime(&locator).ok_or_else(|| {
    RepleteError::UnknownMediaType {
      locator: locator.to_string(),
    }
  })?;
  let body = if locators::is_js(&locator) {
    let text = state.registry.read_text(&locator).await?;
    let analysis = state.registry.analysis(&locator).await?;
    Body::from(
      rewrite_module_source(&state.registry, &locator, &text, &analysis)
        .await?,
    )
  } else {
    Body::from(state.registry.read(&locator).await?)
  };
  Response::builder()
    .status(StatusCode::OK)
    .header(header::CONTENT_TYPE, mime)
    // Padawans commonly have the null origin.
    .header("access-control-allow-origin", origin.unwrap_or("*"))
    .body(body)
    .map_err(|error| anyhow::anyhow!("response: {error}").into())
}

/// Replace every static import, re-export and dynamic specifier with its
/// resolved, versionized, server-relative form. The line count of the
/// source is preserved.
pub async fn rewrite_module_source(
  registry: &Registry,
  locator: &Url,
  source: &str,
  analysis: &ModuleAnalysis,
) -> Result<String, RepleteError> {
  let mut alterations = Vec::new();
  for import in &analysis.imports {
    let served = resolve_served(registry, &import.specifier, locator).await?;
    alterations.push(Alteration::new(
      import.specifier_range.clone(),
      serde_json::to_string(&served).unwrap(),
    ));
  }
  for export in &analysis.exports {
    if let ExportSite::Statement {
      source: Some((specifier, range)),
      ..
    } = export
    {
      let served = resolve_served(registry, specifier, locator).await?;
      alterations.push(Alteration::new(
        range.clone(),
        serde_json::to_string(&served).unwrap(),
      ));
    }
  }
  for dynamic in &analysis.dynamics {
    let served = resolve_served(registry, &dynamic.specifier, locator).await?;
    alterations.push(Alteration::new(
      dynamic.module_range.clone(),
      serde_json::to_string(&served).unwrap(),
    ));
  }
  Ok(alter_string(source, alterations))
}

async fn resolve_served(
  registry: &Registry,
  specifier: &str,
  parent: &Url,
) -> Result<String, RepleteError> {
  let located = registry.locate(specifier, parent).await?;
  let versioned = registry.versionize(&located).await?;
  Ok(served_specifier(&versioned))
}

/// Rewritten specifiers are root-relative, so the same text works for
/// browser padawans and for runtimes importing through the server.
fn served_specifier(locator: &Url) -> String {
  if locator.scheme() == "file" {
    locator.path().to_owned()
  } else {
    locator.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::capabilities::testing::StillCapabilities;

  async fn fixture() -> (tempfile::TempDir, ServerState, Url) {
    let root = tempfile::tempdir().unwrap();
    tokio::fs::write(
      root.path().join("a.js"),
      concat!(
        "import {b} from \"./b.js\";\n",
        "export * from \"./b.js\";\n",
        "import(\"./b.js\");\n",
        "b;\n",
      ),
    )
    .await
    .unwrap();
    tokio::fs::write(root.path().join("b.js"), "export const b = 1;\n")
      .await
      .unwrap();
    tokio::fs::write(root.path().join("plain.txt"), "just text\n")
      .await
      .unwrap();
    let state = ServerState {
      registry: Registry::new(Arc::new(StillCapabilities)),
      capabilities: Arc::new(StillCapabilities),
    };
    let a = Url::from_file_path(root.path().join("a.js")).unwrap();
    (root, state, a)
  }

  #[tokio::test]
  async fn test_serve_rewrites_specifiers() {
    let (root, state, a) = fixture().await;
    let response = serve(&state, a.path(), Some("null")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
      response
        .headers()
        .get("access-control-allow-origin")
        .unwrap(),
      "null"
    );
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let text = std::str::from_utf8(&body).unwrap();
    let expected = format!(
      "/v0/{}{}/b.js",
      state.registry.token(),
      Url::from_directory_path(root.path())
        .unwrap()
        .path()
        .trim_end_matches('/'),
    );
    assert_eq!(text.matches(&expected).count(), 3);
    // The rewrite does not change the line count.
    assert_eq!(text.lines().count(), 4);
  }

  #[tokio::test]
  async fn test_serve_strips_version_prefix() {
    let (_root, state, a) = fixture().await;
    let versioned =
      format!("/v4/{}{}", state.registry.token(), a.path());
    let response = serve(&state, &versioned, None).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
      response
        .headers()
        .get("access-control-allow-origin")
        .unwrap(),
      "*"
    );
  }

  #[tokio::test]
  async fn test_serve_assets_verbatim() {
    let (root, state, _a) = fixture().await;
    let plain = Url::from_file_path(root.path().join("plain.txt")).unwrap();
    let response = serve(&state, plain.path(), None).await.unwrap();
    assert_eq!(
      response.headers().get(header::CONTENT_TYPE).unwrap(),
      "text/plain"
    );
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"just text\n");
  }

  #[tokio::test]
  async fn test_serve_unknown_media_type() {
    let (root, state, _a) = fixture().await;
    tokio::fs::write(root.path().join("mystery.xyz"), "?")
      .await
      .unwrap();
    let mystery =
      Url::from_file_path(root.path().join("mystery.xyz")).unwrap();
    let error = serve(&state, mystery.path(), None).await.unwrap_err();
    assert_eq!(error.code(), "unknownMediaType");
  }

  #[tokio::test]
  async fn test_server_round_trip() {
    let (_root, state, a) = fixture().await;
    let server = SourceServer::start(
      state.registry.clone(),
      state.capabilities.clone(),
      0,
    )
    .await
    .unwrap();
    let uri: hyper::Uri = format!("{}{}", server.origin(), a.path())
      .parse()
      .unwrap();
    let client = hyper::Client::new();
    let response = client.get(uri).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert!(std::str::from_utf8(&body).unwrap().contains("/b.js\";"));
    server.stop().await;
    server.stop().await;
  }
}
