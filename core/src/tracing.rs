// Copyright 2025 the Replete authors. All rights reserved. MIT license.
use tracing_subscriber::Registry;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;

/// Default log level filter, used if `RUST_LOG` is missing or invalid.
const DEFAULT_LOG_LEVEL_FILTER: LevelFilter = LevelFilter::INFO;

/// Initialize tracing infrastructure. Stdout carries the host protocol, so
/// all diagnostics go to stderr, without ANSI colors.
pub fn setup_tracing() {
  let filter = EnvFilter::builder()
    .with_default_directive(DEFAULT_LOG_LEVEL_FILTER.into())
    .from_env_lossy()
    .add_directive("swc_ecma_codegen=off".parse().unwrap());
  let fmt = tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_writer(std::io::stderr);
  let subscriber = Registry::default().with(filter).with(fmt);
  tracing::subscriber::set_global_default(subscriber).unwrap();
}
