// Copyright 2025 the Replete authors. All rights reserved. MIT license.
use std::collections::HashMap;

use clap::Parser;
use url::Url;

use crate::padawan::Platform;

#[derive(Parser, Debug)]
pub struct Config {
  #[clap(long = "port", env = "REPLETE_PORT", default_value = "0")]
  /// The port for the source server. 0 picks an ephemeral port.
  pub port: u16,

  #[clap(long = "webl_port", env = "REPLETE_WEBL_PORT", default_value = "0")]
  /// The port for the browser padawan WebSocket listener. 0 picks an
  /// ephemeral port.
  pub webl_port: u16,

  #[clap(long = "root", env = "REPLETE_ROOT", default_value = ".")]
  /// The directory that reads are confined to. Modules outside of it can
  /// not be imported.
  pub root: String,

  #[clap(long = "node_bin", env = "REPLETE_NODE_BIN", default_value = "node")]
  /// The Node.js binary used for node padawans.
  pub node_bin: String,

  #[clap(long = "deno_bin", env = "REPLETE_DENO_BIN", default_value = "deno")]
  /// The Deno binary used for deno padawans.
  pub deno_bin: String,

  #[clap(long = "bun_bin", env = "REPLETE_BUN_BIN", default_value = "bun")]
  /// The Bun binary used for bun padawans.
  pub bun_bin: String,

  #[clap(long = "tjs_bin", env = "REPLETE_TJS_BIN", default_value = "tjs")]
  /// The Txiki binary used for tjs padawans.
  pub tjs_bin: String,

  #[clap(
    long = "padawan",
    env = "REPLETE_PADAWANS",
    value_delimiter = ','
  )]
  /// Platforms whose padawans are spawned eagerly on start. Others are
  /// spawned on first use.
  pub padawans: Vec<Platform>,
}

impl Config {
  /// The root locator, as an absolute directory URL.
  pub fn root_url(&self) -> Result<Url, anyhow::Error> {
    let canonical = std::fs::canonicalize(&self.root)?;
    Url::from_directory_path(&canonical)
      .map_err(|_| anyhow::anyhow!("invalid root directory: {}", self.root))
  }

  pub fn binaries(&self) -> HashMap<Platform, String> {
    HashMap::from([
      (Platform::Node, self.node_bin.clone()),
      (Platform::Deno, self.deno_bin.clone()),
      (Platform::Bun, self.bun_bin.clone()),
      (Platform::Tjs, self.tjs_bin.clone()),
    ])
  }
}
