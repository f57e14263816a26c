// Copyright 2025 the Replete authors. All rights reserved. MIT license.

//! The command-line padawan transport. The coordinator opens a TCP listener
//! on an ephemeral loopback port, spawns a child runtime configured to
//! connect back to it, and exchanges one JSON object per line over the
//! first accepted socket. If the child dies, every in-flight command is
//! settled with an exception report and a new child is spawned against the
//! same listener.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capabilities::Capabilities;
use crate::errors::RepleteError;
use crate::padawan::Command;
use crate::padawan::LaunchPlan;
use crate::padawan::Padawan;
use crate::padawan::Report;
use crate::padawan::ReportFrame;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPAWN_DELAY: Duration = Duration::from_millis(250);

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Report>>>>;
type SharedWriter = Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>;

pub struct Cmdl {
  port: u16,
  pending: Pending,
  writer: SharedWriter,
  connected: watch::Receiver<bool>,
  stopping: Arc<AtomicBool>,
  stop: Arc<Notify>,
  supervisor: Mutex<Option<JoinHandle<()>>>,
  _script_directory: tempfile::TempDir,
}

impl Cmdl {
  pub async fn create(
    plan: LaunchPlan,
    capabilities: Arc<dyn Capabilities>,
  ) -> Result<Cmdl, RepleteError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    let script_directory = tempfile::tempdir()
      .map_err(|error| anyhow::anyhow!("temp dir: {error}"))?;
    let script_path = script_directory.path().join("padawan.mjs");
    tokio::fs::write(&script_path, plan.client_source).await?;
    let argv = plan.argv(&script_path.display().to_string(), port);

    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(None));
    let (connected_sender, connected) = watch::channel(false);
    let stopping = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(Notify::new());

    let supervisor = tokio::spawn(supervise(
      plan,
      argv,
      listener,
      capabilities,
      pending.clone(),
      writer.clone(),
      connected_sender,
      stopping.clone(),
      stop.clone(),
    ));

    Ok(Cmdl {
      port,
      pending,
      writer,
      connected,
      stopping,
      stop,
      supervisor: Mutex::new(Some(supervisor)),
      _script_directory: script_directory,
    })
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  async fn await_connection(&self) -> bool {
    let mut connected = self.connected.clone();
    if *connected.borrow() {
      return true;
    }
    let _ = tokio::time::timeout(CONNECT_TIMEOUT, async {
      while !*connected.borrow_and_update() {
        if connected.changed().await.is_err() {
          return;
        }
      }
    })
    .await;
    *self.connected.borrow()
  }
}

#[async_trait]
impl Padawan for Cmdl {
  async fn eval(
    &self,
    script: String,
    imports: Vec<String>,
    wait: bool,
  ) -> Result<Report, RepleteError> {
    if !self.await_connection().await {
      return Ok(Report::exception("CMDL died."));
    }
    let id = uuid::Uuid::new_v4().to_string();
    let (sender, receiver) = oneshot::channel();
    self.pending.lock().unwrap().insert(id.clone(), sender);
    let mut frame = serde_json::to_string(&Command {
      script,
      imports,
      wait,
      id: id.clone(),
    })?;
    frame.push('\n');
    {
      let mut writer = self.writer.lock().await;
      let delivered = match writer.as_mut() {
        Some(write_half) => {
          write_half.write_all(frame.as_bytes()).await.is_ok()
        }
        None => false,
      };
      if !delivered {
        self.pending.lock().unwrap().remove(&id);
        return Ok(Report::exception("CMDL died."));
      }
    }
    match receiver.await {
      Ok(report) => Ok(report),
      Err(_) => Ok(Report::exception("CMDL died.")),
    }
  }

  /// Idempotent. Kills the child and closes the listener.
  async fn destroy(&self) {
    if self.stopping.swap(true, Ordering::SeqCst) {
      return;
    }
    self.stop.notify_waiters();
    let supervisor = self.supervisor.lock().unwrap().take();
    if let Some(mut supervisor) = supervisor {
      if tokio::time::timeout(Duration::from_secs(2), &mut supervisor)
        .await
        .is_err()
      {
        // The child is killed when the supervisor task drops it.
        supervisor.abort();
      }
    }
    settle_all(&self.pending, "CMDL died.");
  }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
  plan: LaunchPlan,
  argv: Vec<String>,
  listener: TcpListener,
  capabilities: Arc<dyn Capabilities>,
  pending: Pending,
  writer: SharedWriter,
  connected: watch::Sender<bool>,
  stopping: Arc<AtomicBool>,
  stop: Arc<Notify>,
) {
  while !stopping.load(Ordering::SeqCst) {
    let mut child = match spawn_child(&plan, &argv, &capabilities) {
      Ok(child) => child,
      Err(error) => {
        tracing::error!("failed to spawn {}: {}", plan.program, error);
        settle_all(&pending, "CMDL died.");
        break;
      }
    };
    tokio::select! {
      accepted = listener.accept() => match accepted {
        Ok((socket, _)) => {
          attend(socket, &mut child, &pending, &writer, &connected, &stop)
            .await;
        }
        Err(error) => {
          tracing::error!("padawan listener failed: {}", error);
          let _ = child.kill().await;
          break;
        }
      },
      _ = child.wait() => {
        tracing::warn!("padawan exited before connecting");
      }
      _ = stop.notified() => {
        let _ = child.kill().await;
        break;
      }
    }
    let _ = connected.send(false);
    *writer.lock().await = None;
    settle_all(&pending, "CMDL died.");
    let _ = child.kill().await;
    if stopping.load(Ordering::SeqCst) {
      break;
    }
    tokio::time::sleep(RESPAWN_DELAY).await;
  }
}

/// Relay reports from the connected socket until it closes, the child dies,
/// or shutdown is requested.
async fn attend(
  socket: TcpStream,
  child: &mut Child,
  pending: &Pending,
  writer: &SharedWriter,
  connected: &watch::Sender<bool>,
  stop: &Arc<Notify>,
) {
  let (read_half, write_half) = socket.into_split();
  *writer.lock().await = Some(write_half);
  let _ = connected.send(true);
  let mut lines = BufReader::new(read_half).lines();
  loop {
    tokio::select! {
      line = lines.next_line() => match line {
        Ok(Some(line)) => match serde_json::from_str::<ReportFrame>(&line) {
          Ok(frame) => {
            let sender = pending.lock().unwrap().remove(&frame.id);
            if let Some(sender) = sender {
              let _ = sender.send(Report::from(frame));
            }
          }
          Err(error) => {
            tracing::warn!("discarding malformed report: {}", error);
          }
        },
        Ok(None) | Err(_) => break,
      },
      _ = child.wait() => break,
      _ = stop.notified() => break,
    }
  }
}

fn spawn_child(
  plan: &LaunchPlan,
  argv: &[String],
  capabilities: &Arc<dyn Capabilities>,
) -> std::io::Result<Child> {
  let mut child = tokio::process::Command::new(&plan.program)
    .args(argv)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()?;
  if let Some(stdout) = child.stdout.take() {
    let capabilities = capabilities.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(stdout).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        capabilities.out(&format!("{}\n", line));
      }
    });
  }
  if let Some(stderr) = child.stderr.take() {
    let capabilities = capabilities.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(stderr).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        capabilities.err(&format!("{}\n", line));
      }
    });
  }
  Ok(child)
}

fn settle_all(pending: &Pending, message: &str) {
  let mut pending = pending.lock().unwrap();
  for (_, sender) in pending.drain() {
    let _ = sender.send(Report::exception(message));
  }
}

#[cfg(test)]
mod tests {
  use tokio::io::AsyncReadExt;

  use super::*;

  struct QuietCapabilities;

  #[async_trait]
  impl Capabilities for QuietCapabilities {
    async fn read(
      &self,
      _locator: &url::Url,
    ) -> Result<bytes::Bytes, RepleteError> {
      Err(RepleteError::NotFound)
    }

    async fn watch(&self, _locator: &url::Url) -> Result<(), RepleteError> {
      std::future::pending().await
    }

    fn out(&self, _text: &str) {}
    fn err(&self, _text: &str) {}
  }

  /// A launch plan whose child never connects; the test stands in for the
  /// padawan by connecting to the listener itself.
  fn inert_plan() -> LaunchPlan {
    LaunchPlan {
      program: "sleep".to_owned(),
      args: vec!["3600".to_owned()],
      client_source: "",
    }
  }

  async fn read_frame(socket: &mut TcpStream) -> Command {
    let mut collected = Vec::new();
    let mut byte = [0_u8; 1];
    loop {
      socket.read_exact(&mut byte).await.unwrap();
      if byte[0] == b'\n' {
        break;
      }
      collected.push(byte[0]);
    }
    serde_json::from_slice(&collected).unwrap()
  }

  #[tokio::test]
  async fn test_eval_round_trip_out_of_order() {
    let cmdl = Cmdl::create(inert_plan(), Arc::new(QuietCapabilities))
      .await
      .unwrap();
    let mut socket = TcpStream::connect(("127.0.0.1", cmdl.port()))
      .await
      .unwrap();

    let cmdl = Arc::new(cmdl);
    let first = {
      let cmdl = cmdl.clone();
      tokio::spawn(async move {
        cmdl.eval("1;".to_owned(), vec![], false).await.unwrap()
      })
    };
    let second = {
      let cmdl = cmdl.clone();
      tokio::spawn(async move {
        cmdl.eval("2;".to_owned(), vec![], true).await.unwrap()
      })
    };

    let command_a = read_frame(&mut socket).await;
    let command_b = read_frame(&mut socket).await;
    // Answer in reverse order; correlation is by id, not position.
    for command in [&command_b, &command_a] {
      let report = format!(
        "{}\n",
        serde_json::to_string(&ReportFrame {
          id: command.id.clone(),
          evaluation: Some(format!("answer to {}", command.script)),
          exception: None,
        })
        .unwrap()
      );
      socket.write_all(report.as_bytes()).await.unwrap();
    }

    let reports = [first.await.unwrap(), second.await.unwrap()];
    let scripts = [command_a.script, command_b.script];
    assert!(scripts.contains(&"1;".to_owned()));
    assert!(scripts.contains(&"2;".to_owned()));
    for report in reports {
      assert!(report.evaluation.unwrap().starts_with("answer to "));
      assert!(report.exception.is_none());
    }
    cmdl.destroy().await;
  }

  #[tokio::test]
  async fn test_disconnect_settles_in_flight_commands() {
    let cmdl = Cmdl::create(inert_plan(), Arc::new(QuietCapabilities))
      .await
      .unwrap();
    let mut socket = TcpStream::connect(("127.0.0.1", cmdl.port()))
      .await
      .unwrap();
    let cmdl = Arc::new(cmdl);
    let hanging = {
      let cmdl = cmdl.clone();
      tokio::spawn(
        async move { cmdl.eval("3;".to_owned(), vec![], false).await },
      )
    };
    // Receive the command, then die without answering.
    let _ = read_frame(&mut socket).await;
    drop(socket);
    let report = hanging.await.unwrap().unwrap();
    assert_eq!(report.exception.as_deref(), Some("CMDL died."));
    cmdl.destroy().await;
    cmdl.destroy().await;
  }
}
