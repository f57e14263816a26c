// Copyright 2025 the Replete authors. All rights reserved. MIT license.
use deno_ast::MediaType;
use sha2::Digest;
use url::Url;

/// Builtin modules are identified by the platform's builtin scheme, e.g.
/// `node:fs`.
pub const BUILTIN_SCHEME: &str = "node";

/// The builtin module names recognized in bare specifier position. Specifiers
/// carrying an explicit `node:` prefix are builtins regardless of this list.
pub const NODE_BUILTINS: &[&str] = &[
  "assert",
  "assert/strict",
  "async_hooks",
  "buffer",
  "child_process",
  "cluster",
  "console",
  "constants",
  "crypto",
  "dgram",
  "diagnostics_channel",
  "dns",
  "dns/promises",
  "domain",
  "events",
  "fs",
  "fs/promises",
  "http",
  "http2",
  "https",
  "inspector",
  "module",
  "net",
  "os",
  "path",
  "path/posix",
  "path/win32",
  "perf_hooks",
  "process",
  "punycode",
  "querystring",
  "readline",
  "readline/promises",
  "repl",
  "stream",
  "stream/consumers",
  "stream/promises",
  "stream/web",
  "string_decoder",
  "timers",
  "timers/promises",
  "tls",
  "trace_events",
  "tty",
  "url",
  "util",
  "util/types",
  "v8",
  "vm",
  "wasi",
  "worker_threads",
  "zlib",
];

/// The kinds of strings that may appear in import position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierKind {
  Builtin,
  FullyQualified,
  Relative,
  AbsolutePath,
  Bare,
}

pub fn classify(specifier: &str) -> SpecifierKind {
  if specifier.starts_with("node:") || NODE_BUILTINS.contains(&specifier) {
    SpecifierKind::Builtin
  } else if specifier.starts_with("./") || specifier.starts_with("../") {
    SpecifierKind::Relative
  } else if specifier.starts_with('/') {
    SpecifierKind::AbsolutePath
  } else if Url::parse(specifier).is_ok() {
    SpecifierKind::FullyQualified
  } else {
    SpecifierKind::Bare
  }
}

/// Whether the locator names a JavaScript module, judged by file extension.
pub fn is_js(locator: &Url) -> bool {
  matches!(
    MediaType::from_specifier(locator),
    MediaType::JavaScript | MediaType::Mjs | MediaType::Cjs
  )
}

/// Generate a SHA256 hash of a string.
pub fn hash(data: &str) -> String {
  format!("{:x}", sha2::Sha256::digest(data.as_bytes()))
}

const BASE62: &[u8] =
  b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// The random token that demarcates versioning information from user paths.
/// It is regenerated on every start, invalidating any stale versioned links.
pub fn unguessable() -> String {
  let mut token = String::new();
  for _ in 0..8 {
    token.push(BASE62[rand::random::<usize>() % 62] as char);
  }
  token
}

/// Embed a version number in a file locator, producing
/// `file:///v<N>/<token>/<original-path>`. Non-file and non-JavaScript
/// locators pass through unchanged.
pub fn versionize(locator: &Url, version: u64, token: &str) -> Url {
  if locator.scheme() != "file" || !is_js(locator) {
    return locator.clone();
  }
  Url::parse(&format!("file:///v{}/{}{}", version, token, locator.path()))
    .unwrap()
}

/// Strip a `/v<N>/<token>/` prefix from a URL path, returning the version it
/// carried and the original path. The token must match this REPL's token,
/// otherwise the path is somebody else's and is left alone.
pub fn deversionize(path: &str, token: &str) -> Option<(u64, String)> {
  let rest = path.strip_prefix("/v")?;
  let (version, rest) = rest.split_once('/')?;
  let version = version.parse().ok()?;
  let rest = rest.strip_prefix(token)?;
  if !rest.starts_with('/') {
    return None;
  }
  Some((version, rest.to_owned()))
}
