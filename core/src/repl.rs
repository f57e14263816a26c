// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! The REPL coordinator. It owns the version registry, the source server
//! and the padawans, and turns one evaluation request into one padawan
//! round trip: analyze the fragment, resolve and versionize its specifiers
//! in parallel, REPL-ize the source, dispatch, await the report.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::analyze;
use crate::capabilities::Capabilities;
use crate::cmdl::Cmdl;
use crate::errors::RepleteError;
use crate::padawan::LaunchPlan;
use crate::padawan::Padawan;
use crate::padawan::Platform;
use crate::padawan::Report;
use crate::registry::Registry;
use crate::replize::replize;
use crate::server::SourceServer;
use crate::webl::Webl;

/// One evaluation request from the host, one JSON object per line on
/// stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRequest {
  pub source: String,
  /// Parent module URL for relative imports.
  pub locator: String,
  pub platform: Platform,
  #[serde(default)]
  pub scope: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<serde_json::Value>,
}

/// One result line to the host: exactly one of `evaluation`, `exception`,
/// `out`, `err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResult {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub evaluation: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub exception: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub out: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub err: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<serde_json::Value>,
}

impl HostResult {
  pub fn from_report(
    report: Report,
    id: Option<serde_json::Value>,
  ) -> HostResult {
    HostResult {
      evaluation: report.evaluation,
      exception: report.exception,
      out: None,
      err: None,
      id,
    }
  }

  pub fn exception(
    text: impl Into<String>,
    id: Option<serde_json::Value>,
  ) -> HostResult {
    HostResult {
      evaluation: None,
      exception: Some(text.into()),
      out: None,
      err: None,
      id,
    }
  }

  pub fn out(text: impl Into<String>) -> HostResult {
    HostResult {
      evaluation: None,
      exception: None,
      out: Some(text.into()),
      err: None,
      id: None,
    }
  }

  pub fn err(text: impl Into<String>) -> HostResult {
    HostResult {
      evaluation: None,
      exception: None,
      out: None,
      err: Some(text.into()),
      id: None,
    }
  }
}

pub struct ReplOptions {
  /// Port for the source server; 0 picks an ephemeral port.
  pub server_port: u16,
  /// Port for the browser padawan WebSocket; 0 picks an ephemeral port.
  pub webl_port: u16,
  /// The runtime binary for each command-line platform.
  pub binaries: HashMap<Platform, String>,
  /// Platforms whose padawans are spawned eagerly on start. Others are
  /// spawned on first use.
  pub warm: Vec<Platform>,
}

impl Default for ReplOptions {
  fn default() -> ReplOptions {
    let mut binaries = HashMap::new();
    binaries.insert(Platform::Node, "node".to_owned());
    binaries.insert(Platform::Deno, "deno".to_owned());
    binaries.insert(Platform::Bun, "bun".to_owned());
    binaries.insert(Platform::Tjs, "tjs".to_owned());
    ReplOptions {
      server_port: 0,
      webl_port: 0,
      binaries,
      warm: Vec::new(),
    }
  }
}

pub struct Repl {
  capabilities: Arc<dyn Capabilities>,
  registry: Registry,
  server: SourceServer,
  webl_port: u16,
  binaries: HashMap<Platform, String>,
  padawans: tokio::sync::Mutex<HashMap<Platform, Arc<dyn Padawan>>>,
}

impl Repl {
  pub async fn start(
    options: ReplOptions,
    capabilities: Arc<dyn Capabilities>,
  ) -> Result<Repl, RepleteError> {
    let registry = Registry::new(capabilities.clone());
    let server = SourceServer::start(
      registry.clone(),
      capabilities.clone(),
      options.server_port,
    )
    .await?;
    let repl = Repl {
      capabilities,
      registry,
      server,
      webl_port: options.webl_port,
      binaries: options.binaries,
      padawans: tokio::sync::Mutex::new(HashMap::new()),
    };
    for platform in options.warm {
      repl.padawan(platform).await?;
    }
    Ok(repl)
  }

  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  pub fn server(&self) -> &SourceServer {
    &self.server
  }

  #[tracing::instrument(skip(self, request), fields(platform = ?request.platform, scope = %request.scope))]
  pub async fn evaluate(
    &self,
    request: EvalRequest,
  ) -> Result<Report, RepleteError> {
    let request = self.capabilities.command(request)?;
    let parent = Url::parse(&request.locator).map_err(|_| {
      RepleteError::MalformedRequest {
        msg: format!("invalid locator: {}", request.locator).into(),
      }
    })?;
    let parsed = analyze::parse(&parent, &request.source)?;
    let analysis = analyze::analyze(&parsed);
    let top = analyze::analyze_top(&parsed);
    let imports =
      futures::future::try_join_all(analysis.imports.iter().map(|import| {
        self.resolve_specifier(&import.specifier, &parent)
      }))
      .await?;
    let dynamics =
      futures::future::try_join_all(analysis.dynamics.iter().map(
        |dynamic| self.resolve_specifier(&dynamic.specifier, &parent),
      ))
      .await?;
    let script = replize(
      &request.source,
      &parsed,
      &analysis,
      &top,
      &dynamics,
      &request.scope,
    );
    let padawan = self.padawan(request.platform).await?;
    padawan.eval(script, imports, top.wait).await
  }

  async fn resolve_specifier(
    &self,
    specifier: &str,
    parent: &Url,
  ) -> Result<String, RepleteError> {
    let located = self.registry.locate(specifier, parent).await?;
    let versioned = self.registry.versionize(&located).await?;
    Ok(
      self
        .capabilities
        .specify(&versioned, self.server.origin()),
    )
  }

  async fn padawan(
    &self,
    platform: Platform,
  ) -> Result<Arc<dyn Padawan>, RepleteError> {
    let mut padawans = self.padawans.lock().await;
    if let Some(padawan) = padawans.get(&platform) {
      return Ok(padawan.clone());
    }
    let padawan: Arc<dyn Padawan> = match platform {
      Platform::Browser => Arc::new(Webl::create(self.webl_port).await?),
      _ => {
        let binary = self.binaries.get(&platform).ok_or_else(|| {
          RepleteError::MalformedRequest {
            msg: format!("no binary configured for {:?}", platform).into(),
          }
        })?;
        let plan = LaunchPlan::for_platform(platform, binary)
          .expect("command line platforms have launch plans");
        Arc::new(Cmdl::create(plan, self.capabilities.clone()).await?)
      }
    };
    padawans.insert(platform, padawan.clone());
    Ok(padawan)
  }

  /// Idempotent. Destroys every padawan and stops the source server.
  pub async fn stop(&self) {
    let padawans: Vec<Arc<dyn Padawan>> = {
      let mut padawans = self.padawans.lock().await;
      padawans.drain().map(|(_, padawan)| padawan).collect()
    };
    for padawan in padawans {
      padawan.destroy().await;
    }
    self.server.stop().await;
  }

  #[cfg(test)]
  pub(crate) async fn install_padawan(
    &self,
    platform: Platform,
    padawan: Arc<dyn Padawan>,
  ) {
    self.padawans.lock().await.insert(platform, padawan);
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use async_trait::async_trait;

  use super::*;
  use crate::capabilities::testing::StillCapabilities;

  /// Records the commands it receives and answers with a fixed evaluation.
  struct FakePadawan {
    commands: Mutex<Vec<(String, Vec<String>, bool)>>,
  }

  #[async_trait]
  impl Padawan for FakePadawan {
    async fn eval(
      &self,
      script: String,
      imports: Vec<String>,
      wait: bool,
    ) -> Result<Report, RepleteError> {
      self.commands.lock().unwrap().push((script, imports, wait));
      Ok(Report {
        evaluation: Some("undefined".to_owned()),
        exception: None,
      })
    }

    async fn destroy(&self) {}
  }

  async fn start_repl() -> (tempfile::TempDir, Repl, Arc<FakePadawan>) {
    let root = tempfile::tempdir().unwrap();
    tokio::fs::write(
      root.path().join("b.js"),
      "export const b = 1;\nexport default b;\n",
    )
    .await
    .unwrap();
    let repl = Repl::start(
      ReplOptions::default(),
      Arc::new(StillCapabilities),
    )
    .await
    .unwrap();
    let fake = Arc::new(FakePadawan {
      commands: Mutex::new(Vec::new()),
    });
    repl.install_padawan(Platform::Node, fake.clone()).await;
    (root, repl, fake)
  }

  fn request(root: &tempfile::TempDir, source: &str) -> EvalRequest {
    let parent =
      Url::from_file_path(root.path().join("fragment.js")).unwrap();
    EvalRequest {
      source: source.to_owned(),
      locator: parent.to_string(),
      platform: Platform::Node,
      scope: "demo".to_owned(),
      id: Some(serde_json::json!(1)),
    }
  }

  #[tokio::test]
  async fn test_evaluate_resolves_and_dispatches() {
    let (root, repl, fake) = start_repl().await;
    let report = repl
      .evaluate(request(&root, "import {b} from \"./b.js\";\nb + 1;\n"))
      .await
      .unwrap();
    assert_eq!(report.evaluation.as_deref(), Some("undefined"));
    let commands = fake.commands.lock().unwrap();
    let (script, imports, wait) = &commands[0];
    assert_eq!(imports.len(), 1);
    let expected = format!(
      "{}/v0/{}",
      repl.server().origin(),
      repl.registry().token()
    );
    assert!(
      imports[0].starts_with(&expected),
      "unexpected import: {}",
      imports[0]
    );
    assert!(imports[0].ends_with("/b.js"));
    assert!(script.contains("$imports[0]"));
    assert!(script.contains("\"demo\""));
    assert!(!wait);
    repl.stop().await;
  }

  #[tokio::test]
  async fn test_evaluate_top_level_await() {
    let (root, repl, fake) = start_repl().await;
    repl
      .evaluate(request(&root, "let answer = await Promise.resolve(42);\n"))
      .await
      .unwrap();
    let commands = fake.commands.lock().unwrap();
    let (script, _, wait) = &commands[0];
    assert!(wait);
    assert!(script.contains("async function"));
    repl.stop().await;
  }

  #[tokio::test]
  async fn test_evaluate_builtin_import_passthrough() {
    let (root, repl, fake) = start_repl().await;
    repl
      .evaluate(request(
        &root,
        "import {join} from \"node:path\";\njoin(\"a\", \"b\");\n",
      ))
      .await
      .unwrap();
    let commands = fake.commands.lock().unwrap();
    let (_, imports, _) = &commands[0];
    assert_eq!(imports[0], "node:path");
    repl.stop().await;
  }

  #[tokio::test]
  async fn test_evaluate_rejects_unresolvable_imports() {
    let (root, repl, _fake) = start_repl().await;
    let error = repl
      .evaluate(request(&root, "import x from \"no-such-package\";\n"))
      .await
      .unwrap_err();
    assert_eq!(error.code(), "packageNotFound");
    repl.stop().await;
  }

  #[tokio::test]
  async fn test_evaluate_parse_error() {
    let (root, repl, _fake) = start_repl().await;
    let error = repl
      .evaluate(request(&root, "const = ;"))
      .await
      .unwrap_err();
    assert_eq!(error.code(), "parseFailed");
    repl.stop().await;
  }

  #[tokio::test]
  async fn test_stop_is_idempotent() {
    let (_root, repl, _fake) = start_repl().await;
    repl.stop().await;
    repl.stop().await;
  }

  #[test]
  fn test_host_protocol_serde() {
    let request: EvalRequest = serde_json::from_str(
      r#"{"source": "1;", "locator": "file:///a.js", "platform": "node", "id": 7}"#,
    )
    .unwrap();
    assert_eq!(request.platform, Platform::Node);
    assert_eq!(request.scope, "");
    assert_eq!(request.id, Some(serde_json::json!(7)));

    let result = HostResult::from_report(
      Report {
        evaluation: Some("2".to_owned()),
        exception: None,
      },
      request.id.clone(),
    );
    assert_eq!(
      serde_json::to_string(&result).unwrap(),
      r#"{"evaluation":"2","id":7}"#
    );
    let out = HostResult::out("hello\n");
    assert_eq!(serde_json::to_string(&out).unwrap(), r#"{"out":"hello\n"}"#);
  }
}
