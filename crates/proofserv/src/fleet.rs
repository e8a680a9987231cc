//! Master-side worker fleet.
//!
//! A master connects outward to its configured workers at startup, performs
//! the worker handshake, and from then on drives every connection as an
//! independent FIFO. During a fanned-out command the master sits in
//! [`Fleet::collect`], answering packet, object and limits requests from
//! whichever worker is ready and folding shipped log bytes into its own log,
//! until every active worker has delivered its `LOGDONE`. That collection is
//! the join barrier behind the single client-facing `LOGDONE`.
//!
//! Work distribution is a dispenser over the command's dataset: strictly
//! monotonic, pairwise disjoint `[first, first+count)` ranges, terminated by
//! a `-1` entry count once the dataset is exhausted.

use crate::config::MasterConfig;
use crate::eval::{AxisLimits, Workspace, resolve_axis};
use crate::event::SignalFlags;
use crate::objects::encode_object;
use crate::protocol::{Message, ProtocolError, Tag};
use crate::reporter::{self, Severity};
use crate::socket::CtrlSocket;
use anyhow::{Context, Result};
use log::{debug, info};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::Write;
use std::net::TcpStream;

/// Poll period while collecting; bounds interrupt latency.
const COLLECT_POLL_MS: u16 = 250;
/// Consecutive quiet polls before a post-interrupt drain gives up.
const DRAIN_QUIET_ROUNDS: u32 = 2;

struct Worker {
  ordinal: i32,
  host: String,
  sock: CtrlSocket,
  active: bool,
}

pub struct Fleet {
  workers: Vec<Worker>,
}

/// Result of collecting one fanned-out command.
#[derive(Debug, Clone, Copy)]
pub struct CollectOutcome {
  /// First non-zero worker status, or 0.
  pub status: i32,
  /// The collect loop stopped early because an urgent byte is pending.
  pub interrupted: bool,
}

enum Served {
  Frame,
  LogDone(i32),
  Lost,
}

impl Fleet {
  /// Connects and handshakes the configured workers. Individual failures
  /// are reported and skipped; the session runs with whoever answered.
  pub fn connect(
    cfg: &MasterConfig,
    user: &str,
    protocol: i32,
    master_url: &str,
    log_level: i32,
  ) -> Self {
    debug!("Starting fleet for {master_url}");
    let mut workers = Vec::new();
    for (ordinal, host) in cfg.workers.iter().enumerate() {
      match connect_worker(host, ordinal as i32, user, protocol) {
        Ok(worker) => workers.push(worker),
        Err(e) => reporter::report(
          Severity::Error,
          "fleet",
          &format!("cannot start worker {host}: {e:#}"),
        ),
      }
    }
    info!("Fleet up with {} workers", workers.len());
    let mut fleet = Self { workers };
    if log_level != 1 {
      fleet.set_log_level(log_level);
    }
    fleet
  }

  pub fn active_count(&self) -> i32 {
    self.workers.iter().filter(|w| w.active).count() as i32
  }

  /// In parallel mode commands are forwarded instead of evaluated locally.
  pub fn is_parallel(&self) -> bool {
    self.active_count() > 0
  }

  /// Restricts the fan-out to the first `nodes` workers.
  pub fn set_parallel(&mut self, nodes: i32) {
    for (i, w) in self.workers.iter_mut().enumerate() {
      w.active = (i as i32) < nodes;
    }
    println!("Parallel mode: {} workers", self.active_count());
  }

  /// Propagates the session log level to every active worker.
  pub fn set_log_level(&mut self, level: i32) {
    let msg = Message::with_str(Tag::LogLevel, &level.to_string());
    self.broadcast(&msg);
  }

  /// Probes worker liveness; a failed send deactivates the worker.
  pub fn ping(&mut self) {
    let msg = Message::new(Tag::Ping).with_ack();
    self.broadcast(&msg);
  }

  /// Prints the fleet roster to the session log.
  pub fn print_status(&self) {
    println!(
      "Fleet: {} of {} workers active",
      self.active_count(),
      self.workers.len()
    );
    for w in &self.workers {
      let state = if w.active { "active" } else { "inactive" };
      println!("  worker {} at {} ({})", w.ordinal, w.host, state);
    }
  }

  /// Sends the urgent interrupt byte to every active worker.
  pub fn interrupt(&mut self, byte: u8) {
    for w in self.workers.iter_mut().filter(|w| w.active) {
      if let Err(e) = w.sock.send_raw(&[byte], true) {
        reporter::report(
          Severity::Error,
          "fleet",
          &format!("worker {} lost while interrupting: {}", w.host, e),
        );
        w.active = false;
      }
    }
  }

  fn broadcast(&mut self, msg: &Message) {
    for w in self.workers.iter_mut().filter(|w| w.active) {
      if let Err(e) = w.sock.send(msg) {
        reporter::report(
          Severity::Error,
          "fleet",
          &format!("worker {} lost: {}", w.host, e),
        );
        w.active = false;
      }
    }
  }

  /// Fans a command string out verbatim and collects until every worker's
  /// `LOGDONE` arrived (or an urgent byte preempts the barrier).
  pub fn send_command(
    &mut self,
    cmd: &str,
    workspace: &mut Workspace,
    log: &mut dyn Write,
    signals: &SignalFlags,
    packet_size: Option<i64>,
  ) -> Result<CollectOutcome> {
    let msg = Message::with_str(Tag::Cint, cmd);
    self.broadcast(&msg);
    let mut dispenser = PacketDispenser::for_command(cmd, workspace, self.active_count(), packet_size);
    self.collect(&mut dispenser, workspace, log, Some(signals))
  }

  fn collect(
    &mut self,
    dispenser: &mut PacketDispenser,
    workspace: &mut Workspace,
    log: &mut dyn Write,
    signals: Option<&SignalFlags>,
  ) -> Result<CollectOutcome> {
    let mut done: Vec<bool> = self.workers.iter().map(|w| !w.active).collect();
    let mut status = 0;

    while done.iter().any(|d| !d) {
      if let Some(signals) = signals {
        if signals.urgent_pending() {
          return Ok(CollectOutcome {
            status,
            interrupted: true,
          });
        }
      }

      let ready = self.poll_ready(&done, COLLECT_POLL_MS)?;
      for i in ready {
        match self.serve_worker_frame(i, dispenser, workspace, log) {
          Served::LogDone(s) => {
            done[i] = true;
            if s != 0 && status == 0 {
              status = s;
            }
          }
          Served::Lost => {
            done[i] = true;
            self.workers[i].active = false;
          }
          Served::Frame => {}
        }
      }
    }

    Ok(CollectOutcome {
      status,
      interrupted: false,
    })
  }

  /// Consumes whatever the workers still have in flight after a hard
  /// interrupt: leftover log shipments, aborted-command terminators and
  /// packet requests (answered with the end sentinel). Stops once the
  /// connections stay quiet.
  pub fn drain_after_interrupt(
    &mut self,
    workspace: &mut Workspace,
    log: &mut dyn Write,
  ) -> Result<()> {
    let mut dispenser = PacketDispenser::exhausted();
    let mut quiet = 0;
    let all_done: Vec<bool> = self.workers.iter().map(|w| !w.active).collect();
    while quiet < DRAIN_QUIET_ROUNDS {
      if all_done.iter().all(|d| *d) {
        break;
      }
      let ready = self.poll_ready(&all_done, COLLECT_POLL_MS)?;
      if ready.is_empty() {
        quiet += 1;
        continue;
      }
      quiet = 0;
      for i in ready {
        if let Served::Lost = self.serve_worker_frame(i, &mut dispenser, workspace, log) {
          self.workers[i].active = false;
        }
      }
    }
    Ok(())
  }

  /// Polls the not-yet-done active workers; returns their indices with data
  /// (or a closed stream) pending.
  fn poll_ready(&self, done: &[bool], timeout_ms: u16) -> Result<Vec<usize>> {
    let mut index = Vec::new();
    let mut fds = Vec::new();
    for (i, w) in self.workers.iter().enumerate() {
      if w.active && !done[i] {
        index.push(i);
        fds.push(PollFd::new(w.sock.as_fd(), PollFlags::POLLIN));
      }
    }
    if fds.is_empty() {
      return Ok(Vec::new());
    }
    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
      Ok(0) => Ok(Vec::new()),
      Ok(_) => {
        let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        Ok(
          fds
            .iter()
            .zip(index)
            .filter(|(fd, _)| {
              fd.revents()
                .map(|r| r.intersects(wanted))
                .unwrap_or(false)
            })
            .map(|(_, i)| i)
            .collect(),
        )
      }
      Err(nix::errno::Errno::EINTR) => Ok(Vec::new()),
      Err(e) => Err(e).context("poll worker sockets"),
    }
  }

  /// Reads and answers one frame from worker `i`.
  fn serve_worker_frame(
    &mut self,
    i: usize,
    dispenser: &mut PacketDispenser,
    workspace: &mut Workspace,
    log: &mut dyn Write,
  ) -> Served {
    let w = &mut self.workers[i];
    let mut msg = match w.sock.recv() {
      Ok(m) => m,
      Err(e) => {
        reporter::report(
          Severity::Error,
          "fleet",
          &format!("worker {} connection lost: {}", w.host, e),
        );
        return Served::Lost;
      }
    };

    let result: Result<Served, ProtocolError> = match msg.tag() {
      Some(Tag::GetPacket) => {
        let (count, first, processed) = dispenser.next();
        let mut reply = Message::new(Tag::GetPacket);
        reply.put_i32(count);
        reply.put_i64(first);
        reply.put_i64(processed);
        match w.sock.send(&reply) {
          Ok(()) => Ok(Served::Frame),
          Err(_) => Ok(Served::Lost),
        }
      }
      Some(Tag::GetObject) => match msg.get_str() {
        Ok(namecycle) => {
          let mut reply = Message::new(Tag::Object);
          if let Some(obj) = workspace.fetch(&namecycle) {
            match encode_object(obj) {
              Ok(body) => reply.put_bytes(&body),
              Err(e) => {
                reporter::report(Severity::Error, "fleet", &format!("cannot ship object: {e}"));
              }
            }
          }
          match w.sock.send(&reply) {
            Ok(()) => Ok(Served::Frame),
            Err(_) => Ok(Served::Lost),
          }
        }
        Err(e) => Err(e),
      },
      Some(Tag::Limits) => serve_limits(w, &mut msg),
      Some(Tag::LogFile) => match msg.get_i32() {
        Ok(left) => {
          let mut left = left.max(0) as usize;
          let mut buf = [0u8; 4096];
          while left > 0 {
            let want = left.min(buf.len());
            match w.sock.recv_raw(&mut buf[..want], false) {
              Ok(0) => return Served::Lost,
              Ok(n) => {
                let _ = log.write_all(&buf[..n]);
                left -= n;
              }
              Err(_) => return Served::Lost,
            }
          }
          Ok(Served::Frame)
        }
        Err(e) => Err(e),
      },
      Some(Tag::LogDone) => {
        let status = msg.get_i32().unwrap_or(0);
        let _participants = msg.get_i32().unwrap_or(1);
        Ok(Served::LogDone(status))
      }
      Some(Tag::String) => {
        if let Ok(text) = msg.get_str() {
          debug!("worker {}: {}", w.host, text);
        }
        Ok(Served::Frame)
      }
      other => {
        reporter::report(
          Severity::Error,
          "fleet",
          &format!("unexpected frame {:?} from worker {}", other, w.host),
        );
        Ok(Served::Frame)
      }
    };

    match result {
      Ok(served) => served,
      Err(e) => {
        reporter::report(
          Severity::Error,
          "fleet",
          &format!("bad frame from worker {}: {}", w.host, e),
        );
        Served::Frame
      }
    }
  }
}

fn serve_limits(w: &mut Worker, msg: &mut Message) -> Result<Served, ProtocolError> {
  let dim = msg.get_i32()?.clamp(0, 3);
  let n = msg.get_i64()?;
  let mut axes = Vec::with_capacity(dim as usize);
  for _ in 0..dim {
    axes.push(AxisLimits {
      bins: msg.get_i32()?,
      vmin: msg.get_f64()?,
      vmax: msg.get_f64()?,
    });
  }
  let mut reply = Message::new(Tag::Limits);
  for axis in axes.iter_mut() {
    resolve_axis(n, axis);
    reply.put_i32(axis.bins);
    reply.put_f64(axis.vmin);
    reply.put_f64(axis.vmax);
  }
  match w.sock.send(&reply) {
    Ok(()) => Ok(Served::Frame),
    Err(_) => Ok(Served::Lost),
  }
}

fn connect_worker(host: &str, ordinal: i32, user: &str, protocol: i32) -> Result<Worker> {
  let stream = TcpStream::connect(host).with_context(|| format!("connect {host}"))?;
  let mut sock = CtrlSocket::from_tcp(stream);
  let _ = sock.set_no_delay();
  let _ = sock.set_keep_alive();

  let mut greeting = sock.recv().context("read worker greeting")?;
  if greeting.tag() == Some(Tag::String) {
    if let Ok(text) = greeting.get_str() {
      debug!("worker {host}: {text}");
    }
  }

  let mut handshake = Message::new(Tag::Handshake);
  handshake.put_str(user);
  handshake.put_i32(protocol);
  handshake.put_i32(ordinal);
  sock.send(&handshake).context("send worker handshake")?;

  Ok(Worker {
    ordinal,
    host: host.to_string(),
    sock,
    active: true,
  })
}

/// Dispenses strictly monotonic, pairwise disjoint entry ranges.
struct PacketDispenser {
  total: i64,
  chunk: i64,
  next: i64,
}

impl PacketDispenser {
  fn new(total: i64, chunk: i64) -> Self {
    Self {
      total: total.max(0),
      chunk: chunk.max(1),
      next: 0,
    }
  }

  /// Dispenser for a command: sized from the drawn dataset, empty for
  /// commands that do not process entries.
  fn for_command(
    cmd: &str,
    workspace: &Workspace,
    active_workers: i32,
    packet_size: Option<i64>,
  ) -> Self {
    let Some(name) = cmd.trim().strip_prefix("draw ") else {
      return Self::exhausted();
    };
    let Some(ds) = workspace.dataset(name.trim()) else {
      return Self::exhausted();
    };
    let total = ds.entries();
    // Aim for a few round-trips per worker unless the config pins a size.
    let chunk = packet_size
      .unwrap_or_else(|| total / (4 * active_workers.max(1) as i64))
      .max(1);
    Self::new(total, chunk)
  }

  fn exhausted() -> Self {
    Self::new(0, 1)
  }

  /// Next `(count, first, processed-so-far)`; count `-1` once exhausted.
  fn next(&mut self) -> (i32, i64, i64) {
    if self.next >= self.total {
      return (-1, self.next, self.next);
    }
    let first = self.next;
    let count = self.chunk.min(self.total - first);
    self.next = first + count;
    (count as i32, first, first)
  }
}
