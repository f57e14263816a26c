// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! The browser padawan transport. Browser pages connect to a WebSocket
//! listener and exchange the same Command/Report frames as the command-line
//! transport. The page spawns its padawan (an iframe, popup, worker or the
//! top window itself) with a generated creation script; frames between page
//! and padawan travel over `postMessage`, gated by a per-REPL secret so
//! unrelated messages are ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::errors::RepleteError;
use crate::padawan::Command;
use crate::padawan::Padawan;
use crate::padawan::Report;
use crate::padawan::ReportFrame;

/// The padawan variants a browser page can spawn. The top-window variant is
/// the only one not sandboxed from the host page, and is mutually exclusive
/// with the other top variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeblPadawanKind {
  Iframe,
  Popup,
  Worker,
  TopWindow,
}

struct PendingEntry {
  client: u64,
  sender: oneshot::Sender<Report>,
}

struct ClientHandle {
  id: u64,
  sender: mpsc::UnboundedSender<Message>,
}

type Pending = Arc<Mutex<HashMap<String, PendingEntry>>>;
type Clients = Arc<Mutex<Vec<ClientHandle>>>;

pub struct Webl {
  port: u16,
  secret: String,
  pending: Pending,
  clients: Clients,
  stopping: Arc<AtomicBool>,
  listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl Webl {
  pub async fn create(port: u16) -> Result<Webl, RepleteError> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let port = listener.local_addr()?.port();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let clients: Clients = Arc::new(Mutex::new(Vec::new()));
    let listener_task =
      tokio::spawn(listen(listener, clients.clone(), pending.clone()));
    Ok(Webl {
      port,
      secret: crate::locators::unguessable(),
      pending,
      clients,
      stopping: Arc::new(AtomicBool::new(false)),
      listener_task: Mutex::new(Some(listener_task)),
    })
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn secret(&self) -> &str {
    &self.secret
  }

  /// The script a connected page evaluates to spawn its padawan and relay
  /// frames between the WebSocket and `postMessage`.
  pub fn creation_script(&self, kind: WeblPadawanKind) -> String {
    let spawn = match kind {
      WeblPadawanKind::Iframe => concat!(
        "const frame = document.createElement(\"iframe\");\n",
        "frame.style.display = \"none\";\n",
        "frame.srcdoc = \"<script>\" + $padawan_source + \"<\\/script>\";\n",
        "document.body.append(frame);\n",
        "const padawan = () => frame.contentWindow;\n",
      ),
      WeblPadawanKind::Popup => concat!(
        "const popup = window.open(\"about:blank\", \"_blank\", \"popup\");\n",
        "const script = popup.document.createElement(\"script\");\n",
        "script.textContent = $padawan_source;\n",
        "popup.document.body.append(script);\n",
        "const padawan = () => popup;\n",
      ),
      WeblPadawanKind::Worker => concat!(
        "const blob = new Blob([$padawan_source], {type: \"text/javascript\"});\n",
        "const worker = new Worker(URL.createObjectURL(blob));\n",
        "const padawan = () => worker;\n",
      ),
      WeblPadawanKind::TopWindow => concat!(
        "const script = document.createElement(\"script\");\n",
        "script.textContent = $padawan_source;\n",
        "document.body.append(script);\n",
        "const padawan = () => window;\n",
      ),
    };
    format!(
      concat!(
        "(function () {{\n",
        "const $secret = \"{secret}\";\n",
        "const $padawan_source = {padawan_source};\n",
        "{spawn}",
        "const socket = new WebSocket(\"ws://127.0.0.1:{port}\");\n",
        "window.addEventListener(\"message\", function (event) {{\n",
        "    if (event.data?.secret === $secret && event.data.report) {{\n",
        "        socket.send(JSON.stringify(event.data.report));\n",
        "    }}\n",
        "}});\n",
        "socket.onmessage = function (event) {{\n",
        "    padawan().postMessage(\n",
        "        {{secret: $secret, command: JSON.parse(event.data)}},\n",
        "        \"*\"\n",
        "    );\n",
        "}};\n",
        "}}());\n",
      ),
      secret = self.secret,
      padawan_source =
        serde_json::to_string(&self.padawan_source()).unwrap(),
      spawn = spawn,
      port = self.port,
    )
  }

  /// The source of the in-page padawan itself: it evaluates commands and
  /// posts reports back to its creator.
  fn padawan_source(&self) -> String {
    format!(
      concat!(
        "const $secret = \"{secret}\";\n",
        "const creator = globalThis.opener",
        " ?? globalThis.parent",
        " ?? globalThis;\n",
        "async function perform({{script, imports, wait, id}}) {{\n",
        "    try {{\n",
        "        globalThis.$imports = await Promise.all(\n",
        "            imports.map((specifier) => import(specifier))\n",
        "        );\n",
        "        let value = (0, eval)(script);\n",
        "        if (wait) {{\n",
        "            value = await value;\n",
        "        }}\n",
        "        creator.postMessage(\n",
        "            {{secret: $secret, report: {{id, evaluation: String(value)}}}},\n",
        "            \"*\"\n",
        "        );\n",
        "    }} catch (exception) {{\n",
        "        creator.postMessage(\n",
        "            {{secret: $secret, report: {{\n",
        "                id,\n",
        "                exception: exception?.stack ?? String(exception)\n",
        "            }}}},\n",
        "            \"*\"\n",
        "        );\n",
        "    }}\n",
        "}}\n",
        "globalThis.addEventListener(\"message\", function (event) {{\n",
        "    if (event.data?.secret === $secret && event.data.command) {{\n",
        "        perform(event.data.command);\n",
        "    }}\n",
        "}});\n",
      ),
      secret = self.secret,
    )
  }
}

#[async_trait]
impl Padawan for Webl {
  async fn eval(
    &self,
    script: String,
    imports: Vec<String>,
    wait: bool,
  ) -> Result<Report, RepleteError> {
    let id = uuid::Uuid::new_v4().to_string();
    let frame = serde_json::to_string(&Command {
      script,
      imports,
      wait,
      id: id.clone(),
    })?;
    let (sender, receiver) = oneshot::channel();
    let delivered = {
      let clients = self.clients.lock().unwrap();
      // Commands go to the most recently connected page.
      match clients.last() {
        Some(client) => {
          self.pending.lock().unwrap().insert(
            id.clone(),
            PendingEntry {
              client: client.id,
              sender,
            },
          );
          client.sender.send(Message::Text(frame)).is_ok()
        }
        None => false,
      }
    };
    if !delivered {
      self.pending.lock().unwrap().remove(&id);
      return Ok(Report::exception("WEBL died."));
    }
    match receiver.await {
      Ok(report) => Ok(report),
      Err(_) => Ok(Report::exception("WEBL died.")),
    }
  }

  async fn destroy(&self) {
    if self.stopping.swap(true, Ordering::SeqCst) {
      return;
    }
    let listener_task = self.listener_task.lock().unwrap().take();
    if let Some(listener_task) = listener_task {
      listener_task.abort();
    }
    self.clients.lock().unwrap().clear();
    let mut pending = self.pending.lock().unwrap();
    for (_, entry) in pending.drain() {
      let _ = entry.sender.send(Report::exception("WEBL died."));
    }
  }
}

async fn listen(listener: TcpListener, clients: Clients, pending: Pending) {
  let next_client = AtomicU64::new(0);
  loop {
    let Ok((stream, _)) = listener.accept().await else {
      break;
    };
    let client_id = next_client.fetch_add(1, Ordering::SeqCst);
    let clients = clients.clone();
    let pending = pending.clone();
    tokio::spawn(async move {
      let Ok(websocket) = tokio_tungstenite::accept_async(stream).await
      else {
        return;
      };
      let (mut sink, mut stream) = websocket.split();
      let (sender, mut outbox) = mpsc::unbounded_channel::<Message>();
      clients.lock().unwrap().push(ClientHandle {
        id: client_id,
        sender,
      });
      let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
          if sink.send(message).await.is_err() {
            break;
          }
        }
      });
      while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
          continue;
        };
        match serde_json::from_str::<ReportFrame>(&text) {
          Ok(frame) => {
            let entry = pending.lock().unwrap().remove(&frame.id);
            if let Some(entry) = entry {
              let _ = entry.sender.send(Report::from(frame));
            }
          }
          Err(error) => {
            tracing::warn!("discarding malformed report: {}", error);
          }
        }
      }
      // The page went away: unregister it and settle its in-flight
      // commands.
      clients.lock().unwrap().retain(|client| client.id != client_id);
      let mut pending = pending.lock().unwrap();
      let settled: Vec<String> = pending
        .iter()
        .filter(|(_, entry)| entry.client == client_id)
        .map(|(id, _)| id.clone())
        .collect();
      for id in settled {
        if let Some(entry) = pending.remove(&id) {
          let _ = entry.sender.send(Report::exception("WEBL died."));
        }
      }
      writer.abort();
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_eval_without_client() {
    let webl = Webl::create(0).await.unwrap();
    let report = webl.eval("1;".to_owned(), vec![], false).await.unwrap();
    assert_eq!(report.exception.as_deref(), Some("WEBL died."));
    webl.destroy().await;
  }

  async fn wait_for_client(webl: &Webl) {
    while webl.clients.lock().unwrap().is_empty() {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
  }

  #[tokio::test]
  async fn test_eval_round_trip() {
    let webl = Webl::create(0).await.unwrap();
    let (mut socket, _) = tokio_tungstenite::connect_async(format!(
      "ws://127.0.0.1:{}",
      webl.port()
    ))
    .await
    .unwrap();
    wait_for_client(&webl).await;

    let webl = Arc::new(webl);
    let evaluation = {
      let webl = webl.clone();
      tokio::spawn(async move {
        webl.eval("6 * 7;".to_owned(), vec![], false).await.unwrap()
      })
    };

    // Wait for this test's stand-in page to register as a client.
    let Some(Ok(Message::Text(text))) = socket.next().await else {
      panic!("expected a command frame");
    };
    let command: Command = serde_json::from_str(&text).unwrap();
    assert_eq!(command.script, "6 * 7;");
    let report = serde_json::to_string(&ReportFrame {
      id: command.id,
      evaluation: Some("42".to_owned()),
      exception: None,
    })
    .unwrap();
    socket.send(Message::Text(report)).await.unwrap();

    let report = evaluation.await.unwrap();
    assert_eq!(report.evaluation.as_deref(), Some("42"));
    webl.destroy().await;
  }

  #[tokio::test]
  async fn test_disconnect_settles_in_flight_commands() {
    let webl = Webl::create(0).await.unwrap();
    let (mut socket, _) = tokio_tungstenite::connect_async(format!(
      "ws://127.0.0.1:{}",
      webl.port()
    ))
    .await
    .unwrap();
    wait_for_client(&webl).await;
    let webl = Arc::new(webl);
    let evaluation = {
      let webl = webl.clone();
      tokio::spawn(
        async move { webl.eval("1;".to_owned(), vec![], false).await },
      )
    };
    let Some(Ok(Message::Text(_))) = socket.next().await else {
      panic!("expected a command frame");
    };
    drop(socket);
    let report = evaluation.await.unwrap().unwrap();
    assert_eq!(report.exception.as_deref(), Some("WEBL died."));
    webl.destroy().await;
  }

  #[test]
  fn test_creation_scripts() {
    let webl = Webl {
      port: 4002,
      secret: "S3cr3tS3".to_owned(),
      pending: Arc::new(Mutex::new(HashMap::new())),
      clients: Arc::new(Mutex::new(Vec::new())),
      stopping: Arc::new(AtomicBool::new(false)),
      listener_task: Mutex::new(None),
    };
    for kind in [
      WeblPadawanKind::Iframe,
      WeblPadawanKind::Popup,
      WeblPadawanKind::Worker,
      WeblPadawanKind::TopWindow,
    ] {
      let script = webl.creation_script(kind);
      assert!(script.contains("S3cr3tS3"));
      assert!(script.contains("ws://127.0.0.1:4002"));
      assert!(script.contains("postMessage"));
    }
    assert!(webl.creation_script(WeblPadawanKind::Worker).contains("new Worker"));
  }
}
