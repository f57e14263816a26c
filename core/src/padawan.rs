// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! Padawans: the isolated JavaScript execution contexts the coordinator
//! evaluates scripts in. The command-line variants run a small embedded
//! client in a child process that connects back over TCP; the browser
//! variant connects over a WebSocket. All variants share one behavioral
//! interface and one wire protocol: a JSON object per line (or frame),
//! `{script, imports, wait, id}` one way and
//! `{id, evaluation | exception}` the other.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::RepleteError;

/// The runtimes an evaluation can target.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
  Browser,
  Node,
  Deno,
  Bun,
  Tjs,
}

impl std::str::FromStr for Platform {
  type Err = String;

  fn from_str(text: &str) -> Result<Platform, String> {
    match text {
      "browser" => Ok(Platform::Browser),
      "node" => Ok(Platform::Node),
      "deno" => Ok(Platform::Deno),
      "bun" => Ok(Platform::Bun),
      "tjs" => Ok(Platform::Tjs),
      _ => Err(format!("unknown platform: {}", text)),
    }
  }
}

/// One command sent to a padawan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
  pub script: String,
  pub imports: Vec<String>,
  pub wait: bool,
  pub id: String,
}

/// The padawan's answer. An exception raised by the evaluated script is a
/// successful round trip, not a transport failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub evaluation: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub exception: Option<String>,
}

impl Report {
  pub fn exception(text: impl Into<String>) -> Report {
    Report {
      evaluation: None,
      exception: Some(text.into()),
    }
  }
}

/// A report as it appears on the wire, carrying the correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFrame {
  pub id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub evaluation: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub exception: Option<String>,
}

impl From<ReportFrame> for Report {
  fn from(frame: ReportFrame) -> Report {
    Report {
      evaluation: frame.evaluation,
      exception: frame.exception,
    }
  }
}

/// The behavioral interface shared by every padawan variant.
#[async_trait]
pub trait Padawan: Send + Sync {
  async fn eval(
    &self,
    script: String,
    imports: Vec<String>,
    wait: bool,
  ) -> Result<Report, RepleteError>;

  async fn destroy(&self);
}

/// How to spawn a command-line padawan: the program and its arguments, with
/// `{script}` and `{port}` placeholders.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
  pub program: String,
  pub args: Vec<String>,
  pub client_source: &'static str,
}

impl LaunchPlan {
  pub fn for_platform(platform: Platform, binary: &str) -> Option<LaunchPlan> {
    let plan = match platform {
      Platform::Node => LaunchPlan {
        program: binary.to_owned(),
        args: vec![
          "--experimental-network-imports".to_owned(),
          "{script}".to_owned(),
          "{port}".to_owned(),
        ],
        client_source: NODE_PADAWAN,
      },
      Platform::Bun => LaunchPlan {
        program: binary.to_owned(),
        args: vec![
          "run".to_owned(),
          "{script}".to_owned(),
          "{port}".to_owned(),
        ],
        client_source: NODE_PADAWAN,
      },
      Platform::Deno => LaunchPlan {
        program: binary.to_owned(),
        args: vec![
          "run".to_owned(),
          "--quiet".to_owned(),
          "--allow-all".to_owned(),
          "{script}".to_owned(),
          "{port}".to_owned(),
        ],
        client_source: DENO_PADAWAN,
      },
      Platform::Tjs => LaunchPlan {
        program: binary.to_owned(),
        args: vec![
          "run".to_owned(),
          "{script}".to_owned(),
          "{port}".to_owned(),
        ],
        client_source: TJS_PADAWAN,
      },
      Platform::Browser => return None,
    };
    Some(plan)
  }

  pub fn argv(&self, script_path: &str, port: u16) -> Vec<String> {
    self
      .args
      .iter()
      .map(|arg| {
        arg
          .replace("{script}", script_path)
          .replace("{port}", &port.to_string())
      })
      .collect()
  }
}

/// The client evaluated by Node and Bun padawans.
pub const NODE_PADAWAN: &str = r#"// The Replete padawan for Node and Bun.
import {createConnection} from "node:net";
import {inspect} from "node:util";

const port = Number(process.argv[2]);

function show(value) {
    return inspect(value, {depth: 8, maxArrayLength: 100});
}

function show_exception(exception) {
    return (
        exception instanceof Error && typeof exception.stack === "string"
        ? exception.stack
        : show(exception)
    );
}

const socket = createConnection(port, "127.0.0.1");
socket.setEncoding("utf8");

function report(object) {
    socket.write(JSON.stringify(object) + "\n");
}

async function perform({script, imports, wait, id}) {
    try {
        globalThis.$imports = await Promise.all(
            imports.map((specifier) => import(specifier))
        );
        let value = (0, eval)(script);
        if (wait) {
            value = await value;
        }
        report({id, evaluation: show(value)});
    } catch (exception) {
        report({id, exception: show_exception(exception)});
    }
}

let buffer = "";
socket.on("data", function (chunk) {
    buffer += chunk;
    const lines = buffer.split("\n");
    buffer = lines.pop();
    lines.filter((line) => line !== "").forEach(function (line) {
        perform(JSON.parse(line));
    });
});
socket.on("close", function () {
    process.exit(0);
});
"#;

/// The client evaluated by Deno padawans.
pub const DENO_PADAWAN: &str = r#"// The Replete padawan for Deno.
const port = Number(Deno.args[0]);

function show(value) {
    return Deno.inspect(value, {depth: 8, iterableLimit: 100});
}

function show_exception(exception) {
    return (
        exception instanceof Error && typeof exception.stack === "string"
        ? exception.stack
        : show(exception)
    );
}

const connection = await Deno.connect({hostname: "127.0.0.1", port});
const encoder = new TextEncoder();
const writer = connection.writable.getWriter();

function report(object) {
    return writer.write(encoder.encode(JSON.stringify(object) + "\n"));
}

async function perform({script, imports, wait, id}) {
    try {
        globalThis.$imports = await Promise.all(
            imports.map((specifier) => import(specifier))
        );
        let value = (0, eval)(script);
        if (wait) {
            value = await value;
        }
        await report({id, evaluation: show(value)});
    } catch (exception) {
        await report({id, exception: show_exception(exception)});
    }
}

let buffer = "";
for await (
    const chunk of connection.readable.pipeThrough(new TextDecoderStream())
) {
    buffer += chunk;
    const lines = buffer.split("\n");
    buffer = lines.pop();
    for (const line of lines.filter((line) => line !== "")) {
        perform(JSON.parse(line));
    }
}
"#;

/// The client evaluated by Txiki padawans.
pub const TJS_PADAWAN: &str = r#"// The Replete padawan for Txiki.
const port = Number(tjs.args[tjs.args.length - 1]);

function show(value) {
    try {
        return (
            typeof value === "string"
            ? JSON.stringify(value)
            : String(value)
        );
    } catch (_) {
        return Object.prototype.toString.call(value);
    }
}

function show_exception(exception) {
    return (
        exception instanceof Error && typeof exception.stack === "string"
        ? exception.stack
        : show(exception)
    );
}

const connection = await tjs.connect("tcp", "127.0.0.1", port);
const encoder = new TextEncoder();
const decoder = new TextDecoder();

function report(object) {
    return connection.write(encoder.encode(JSON.stringify(object) + "\n"));
}

async function perform({script, imports, wait, id}) {
    try {
        globalThis.$imports = await Promise.all(
            imports.map((specifier) => import(specifier))
        );
        let value = (0, eval)(script);
        if (wait) {
            value = await value;
        }
        await report({id, evaluation: show(value)});
    } catch (exception) {
        await report({id, exception: show_exception(exception)});
    }
}

let buffer = "";
const bytes = new Uint8Array(65536);
while (true) {
    const amount = await connection.read(bytes);
    if (amount === null) {
        break;
    }
    buffer += decoder.decode(bytes.subarray(0, amount));
    const lines = buffer.split("\n");
    buffer = lines.pop();
    for (const line of lines.filter((line) => line !== "")) {
        perform(JSON.parse(line));
    }
}
"#;
