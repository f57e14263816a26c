// Copyright 2025 the Replete authors. All rights reserved. MIT license.
mod analyze;
mod capabilities;
mod cmdl;
mod config;
mod errors;
mod errors_internal;
mod locators;
mod node_resolver;
mod padawan;
mod registry;
mod repl;
mod replize;
mod rewrite;
mod server;
mod tracing;
mod webl;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use url::Url;

use crate::capabilities::Capabilities;
use crate::capabilities::FsCapabilities;
use crate::config::Config;
use crate::errors::RepleteError;
use crate::repl::EvalRequest;
use crate::repl::HostResult;
use crate::repl::Repl;
use crate::repl::ReplOptions;
use crate::tracing::setup_tracing;

/// The filesystem capability set, with padawan side band output routed to
/// the host as `{out}`/`{err}` result lines.
struct HostCapabilities {
  fs: FsCapabilities,
  results: mpsc::UnboundedSender<HostResult>,
}

#[async_trait]
impl Capabilities for HostCapabilities {
  async fn read(&self, locator: &Url) -> Result<Bytes, RepleteError> {
    self.fs.read(locator).await
  }

  async fn watch(&self, locator: &Url) -> Result<(), RepleteError> {
    self.fs.watch(locator).await
  }

  fn out(&self, text: &str) {
    let _ = self.results.send(HostResult::out(text));
  }

  fn err(&self, text: &str) {
    let _ = self.results.send(HostResult::err(text));
  }
}

#[tokio::main]
async fn main() {
  dotenvy::dotenv().ok();
  let config = Config::parse();
  setup_tracing();

  let root = match config.root_url() {
    Ok(root) => root,
    Err(error) => {
      eprintln!("replete: {}", error);
      std::process::exit(1);
    }
  };
  let (results_sender, mut results) = mpsc::unbounded_channel();
  let fs = match FsCapabilities::new(root) {
    Ok(fs) => fs,
    Err(error) => {
      eprintln!("replete: {}", error);
      std::process::exit(1);
    }
  };
  let capabilities = Arc::new(HostCapabilities {
    fs,
    results: results_sender.clone(),
  });
  let repl = match Repl::start(
    ReplOptions {
      server_port: config.port,
      webl_port: config.webl_port,
      binaries: config.binaries(),
      warm: config.padawans.clone(),
    },
    capabilities,
  )
  .await
  {
    Ok(repl) => Arc::new(repl),
    Err(error) => {
      eprintln!("replete: {}", error);
      std::process::exit(1);
    }
  };
  ::tracing::info!("source server on {}", repl.server().origin());

  // One writer task keeps result lines from interleaving.
  let writer = tokio::spawn(async move {
    let mut stdout = tokio::io::stdout();
    while let Some(result) = results.recv().await {
      let mut line = serde_json::to_string(&result).unwrap();
      line.push('\n');
      if stdout.write_all(line.as_bytes()).await.is_err() {
        break;
      }
      let _ = stdout.flush().await;
    }
  });

  // One request per line. Evaluations run concurrently; the padawan
  // processes commands in the order they arrive on its socket.
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Ok(Some(line)) = lines.next_line().await {
    if line.trim().is_empty() {
      continue;
    }
    let request: EvalRequest = match serde_json::from_str(&line) {
      Ok(request) => request,
      Err(error) => {
        let _ = results_sender.send(HostResult::exception(
          format!("Malformed request: {}.", error),
          None,
        ));
        continue;
      }
    };
    let repl = repl.clone();
    let results_sender = results_sender.clone();
    tokio::spawn(async move {
      let id = request.id.clone();
      let result = match repl.evaluate(request).await {
        Ok(report) => HostResult::from_report(report, id),
        Err(error) => HostResult::exception(error.to_string(), id),
      };
      let _ = results_sender.send(result);
    });
  }

  repl.stop().await;
  writer.abort();
}
