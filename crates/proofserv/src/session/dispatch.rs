//! Request dispatcher: one inbound frame in, at most one log flush out.
//!
//! Every dispatched request increments the command counter and accumulates
//! wall-clock and cpu time. Handlers that produce client-visible output end
//! with a log flush so the output and the `LOGDONE` barrier arrive together;
//! the remaining handlers are silent. Unknown tags are reported and the
//! session keeps running; a failed receive means the peer is gone and ends
//! the session with exit 0.

use super::{Flow, Role, Session};
use crate::eval::{EvalContext, LocalLink};
use crate::objects::decode_object;
use crate::protocol::{Message, Tag};
use crate::reporter::{self, Severity};
use crate::session::packets::RemoteLink;
use crate::transfer::receive_file;
use anyhow::Result;
use log::debug;
use nix::sys::resource::{UsageWho, getrusage};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

impl Session {
  /// Handles one inbound request frame.
  pub(crate) fn handle_socket_input(&mut self) -> Result<Flow> {
    let mut msg = match self.socket.recv() {
      Ok(m) => m,
      // Peer loss ends the session.
      Err(_) => return Ok(Flow::Exit(0)),
    };

    let started = Instant::now();
    let cpu_started = cpu_time_now();
    self.ncmd += 1;
    // Each request starts with a clean cooperative-interrupt slate.
    self.interrupt.store(false, Ordering::Relaxed);

    let mut flush = false;
    let mut flow = Flow::Continue;

    match msg.tag() {
      Some(Tag::Cint) => {
        let (f, wants_flush) = self.handle_cint(&mut msg)?;
        flow = f;
        flush = wants_flush;
      }
      Some(Tag::String) => {
        if let Ok(text) = msg.get_str() {
          debug!("peer: {text}");
        }
      }
      Some(Tag::Object) => match decode_object(&msg.take_rest()) {
        Ok(obj) => debug!("peer shipped object {}", obj.name()),
        Err(e) => reporter::report(Severity::Error, "handle_socket_input", &e.to_string()),
      },
      Some(Tag::GroupView) => self.handle_group_view(&mut msg),
      Some(Tag::LogLevel) => self.handle_log_level(&mut msg),
      Some(Tag::Ping) => {
        if let Some(fleet) = &mut self.fleet {
          fleet.ping();
        }
        // The round-trip itself is the acknowledgement.
      }
      Some(Tag::Print) => {
        self.handle_print();
        flush = true;
      }
      Some(Tag::Reset) => self.handle_reset(&mut msg),
      Some(Tag::Status) => {
        if self.handle_status().is_err() {
          flow = Flow::Exit(0);
        }
      }
      Some(Tag::Stop) => flow = Flow::Exit(0),
      Some(Tag::TreeDraw) => self.handle_tree_draw(&mut msg),
      Some(Tag::SendFile) => self.handle_send_file(&mut msg),
      Some(Tag::OpenFile) => {
        self.handle_open_file(&mut msg);
        flush = true;
      }
      Some(Tag::Parallel) => {
        if self.is_master() {
          self.handle_parallel(&mut msg);
          flush = true;
        }
      }
      Some(Tag::Fatal) => {
        reporter::report(
          Severity::Error,
          "handle_socket_input",
          "peer reported a fatal error",
        );
      }
      Some(
        tag @ (Tag::Handshake
        | Tag::GetPacket
        | Tag::GetObject
        | Tag::Limits
        | Tag::LogFile
        | Tag::LogDone),
      ) => {
        reporter::report(
          Severity::Error,
          "handle_socket_input",
          &format!("unexpected {tag:?} on a session endpoint"),
        );
      }
      None => {
        reporter::report(
          Severity::Error,
          "handle_socket_input",
          &format!("unknown command {}", msg.raw_tag()),
        );
      }
    }

    self.real_time += started.elapsed();
    self.cpu_time += cpu_time_now().saturating_sub(cpu_started);

    if flush && !matches!(flow, Flow::Exit(_)) && self.send_log(0).is_err() {
      flow = Flow::Exit(0);
    }
    Ok(flow)
  }

  /// `CINT`: forward to the fleet in parallel mode, evaluate locally
  /// otherwise. Returns the flow plus whether to flush the log.
  fn handle_cint(&mut self, msg: &mut Message) -> Result<(Flow, bool)> {
    let cmd = match msg.get_str() {
      Ok(c) => c,
      Err(e) => {
        reporter::report(Severity::Error, "handle_cint", &e.to_string());
        return Ok((Flow::Continue, false));
      }
    };

    let parallel = self.is_master() && self.fleet.as_ref().is_some_and(|f| f.is_parallel());
    if parallel {
      let Session {
        fleet,
        workspace,
        log,
        events,
        config,
        ..
      } = self;
      let Some(fleet) = fleet.as_mut() else {
        return Ok((Flow::Continue, false));
      };
      let outcome = fleet.send_command(
        &cmd,
        workspace,
        log.writer(),
        events.signals(),
        config.master.packet_size,
      )?;
      if outcome.interrupted {
        // An urgent byte preempted the barrier. The loop classifies it
        // next; its own flush replaces this command's.
        return Ok((Flow::Continue, false));
      }
      if outcome.status != 0 {
        reporter::report(
          Severity::Error,
          "handle_cint",
          &format!("worker command finished with status {}", outcome.status),
        );
      }
      return Ok((Flow::Continue, true));
    }

    if self.log_level > 1 {
      let line = match self.role {
        Role::Master => format!("Master processing: {cmd}..."),
        Role::Worker => format!("Slave {} processing: {cmd}...", self.ordinal),
      };
      reporter::report(Severity::Info, "handle_cint", &line);
    }
    if let Err(e) = self.evaluate_local(&cmd) {
      reporter::report(Severity::Error, "handle_cint", &format!("{e:#}"));
    }
    Ok((Flow::Continue, true))
  }

  /// Evaluates a command on the loop thread. Workers pull packets and
  /// objects from their master; masters (and everything outside a draw)
  /// use the local link.
  pub(crate) fn evaluate_local(&mut self, cmd: &str) -> Result<()> {
    let Session {
      evaluator,
      workspace,
      socket,
      interrupt,
      entries_processed,
      events,
      role,
      ..
    } = self;
    match role {
      Role::Worker => {
        let mut link = RemoteLink::new(socket, entries_processed, events.signals());
        let mut ctx = EvalContext {
          workspace,
          link: &mut link,
          interrupt,
        };
        evaluator.process_line(cmd, &mut ctx)
      }
      Role::Master => {
        let mut link = LocalLink::new();
        let mut ctx = EvalContext {
          workspace,
          link: &mut link,
          interrupt,
        };
        evaluator.process_line(cmd, &mut ctx)
      }
    }
  }

  /// `GROUPVIEW`: `"<group-id> <group-size>"`.
  fn handle_group_view(&mut self, msg: &mut Message) {
    let Ok(text) = msg.get_str() else {
      return;
    };
    let mut parts = text.split_whitespace();
    if let (Some(id), Some(size)) = (parts.next(), parts.next()) {
      if let (Ok(id), Ok(size)) = (id.parse(), size.parse()) {
        self.group_id = id;
        self.group_size = size;
        return;
      }
    }
    reporter::report(
      Severity::Error,
      "handle_group_view",
      &format!("malformed group view '{text}'"),
    );
  }

  /// `LOGLEVEL`: store and, on masters, propagate to the fleet.
  fn handle_log_level(&mut self, msg: &mut Message) {
    let Ok(text) = msg.get_str() else {
      return;
    };
    match text.trim().parse::<i32>() {
      Ok(level) => {
        self.log_level = level;
        if let Some(fleet) = &mut self.fleet {
          fleet.set_log_level(level);
        }
      }
      Err(_) => reporter::report(
        Severity::Error,
        "handle_log_level",
        &format!("malformed log level '{text}'"),
      ),
    }
  }

  /// `PRINT`: status line into the log.
  fn handle_print(&self) {
    match self.role {
      Role::Master => {
        println!(
          "Session for {} in {} (config {})",
          self.user,
          self.work_dir.display(),
          if self.conf_file.is_empty() {
            "default"
          } else {
            &self.conf_file
          }
        );
        match &self.fleet {
          Some(fleet) => fleet.print_status(),
          None => println!("No fleet configured"),
        }
      }
      Role::Worker => println!("This is slave {} @ {}", self.ordinal, super::hostname()),
    }
  }

  /// `RESET`: chdir, restore the evaluator baseline, destroy every
  /// non-dataset object.
  fn handle_reset(&mut self, msg: &mut Message) {
    let Ok(dir) = msg.get_str() else {
      return;
    };
    if !dir.is_empty() {
      if let Err(e) = std::env::set_current_dir(&dir) {
        reporter::sys_report("handle_reset", &format!("cannot enter {dir}"), &e);
      }
    }
    let baseline = self.baseline.clone();
    self.evaluator.restore(&baseline);
    self.workspace.reset_keep_datasets();
    self.interrupt.store(false, Ordering::Relaxed);
  }

  /// `STATUS`: workers report counters, masters the active worker count.
  fn handle_status(&mut self) -> std::io::Result<()> {
    let mut reply = Message::new(Tag::Status);
    match self.role {
      Role::Worker => {
        reply.put_i64(self.workspace.total_bytes_read() as i64);
        reply.put_f64(self.real_time.as_secs_f64());
        reply.put_f64(self.cpu_time.as_secs_f64());
        let cwd = std::env::current_dir()
          .map(|p| p.display().to_string())
          .unwrap_or_default();
        reply.put_str(&cwd);
      }
      Role::Master => {
        reply.put_i32(self.participants());
      }
    }
    self.socket.send(&reply)
  }

  /// `TREEDRAW`: `"<name> <max-virtual> <estimate>"` dataset tuning.
  fn handle_tree_draw(&mut self, msg: &mut Message) {
    let Ok(text) = msg.get_str() else {
      return;
    };
    let mut parts = text.split_whitespace();
    let (Some(name), Some(maxv), Some(est)) = (parts.next(), parts.next(), parts.next()) else {
      reporter::report(
        Severity::Error,
        "handle_tree_draw",
        &format!("malformed tuning request '{text}'"),
      );
      return;
    };
    let (Ok(maxv), Ok(est)) = (maxv.parse(), est.parse()) else {
      reporter::report(
        Severity::Error,
        "handle_tree_draw",
        &format!("malformed tuning request '{text}'"),
      );
      return;
    };
    match self.workspace.dataset_mut(name) {
      Some(ds) => {
        ds.set_max_virtual_size(maxv);
        ds.set_estimate(est);
      }
      None => debug!("no dataset '{name}' to tune"),
    }
  }

  /// `SENDFILE`: `"<name> <binary?> <size>"` followed by raw bytes.
  fn handle_send_file(&mut self, msg: &mut Message) {
    let Ok(text) = msg.get_str() else {
      return;
    };
    let mut parts = text.split_whitespace();
    let (Some(name), Some(bin), Some(size)) = (parts.next(), parts.next(), parts.next()) else {
      reporter::report(
        Severity::Error,
        "handle_send_file",
        &format!("malformed file announcement '{text}'"),
      );
      return;
    };
    let (Ok(bin), Ok(size)) = (bin.parse::<i32>(), size.parse::<i64>()) else {
      reporter::report(
        Severity::Error,
        "handle_send_file",
        &format!("malformed file announcement '{text}'"),
      );
      return;
    };
    let _ = receive_file(&self.socket, Path::new(name), bin != 0, size);
  }

  /// `OPENFILE`: `{class, filename, options}`. Masters gate remote-class
  /// opens behind the credential probe.
  fn handle_open_file(&mut self, msg: &mut Message) {
    let (class, filename, options) = match (msg.get_str(), msg.get_str(), msg.get_str()) {
      (Ok(c), Ok(f), Ok(o)) => (c, f, o),
      _ => {
        reporter::report(Severity::Error, "handle_open_file", "malformed open request");
        return;
      }
    };
    let cmd = format!("open(\"{filename}\", \"{options}\")");

    if self.is_master() && class == "net" {
      let host = url_host(&filename);
      if !self.auth.check(&host, &self.user, &self.secret) {
        reporter::report(
          Severity::Error,
          "handle_open_file",
          &format!("cannot execute \"{cmd}\" since authentication is not possible"),
        );
        return;
      }
    }
    if let Err(e) = self.evaluate_local(&cmd) {
      reporter::report(Severity::Error, "handle_open_file", &format!("{e:#}"));
    }
  }

  /// `PARALLEL`: adjust the fan-out width.
  fn handle_parallel(&mut self, msg: &mut Message) {
    let Ok(nodes) = msg.get_i32() else {
      reporter::report(Severity::Error, "handle_parallel", "malformed node count");
      return;
    };
    if let Some(fleet) = &mut self.fleet {
      fleet.set_parallel(nodes);
    } else {
      println!("Parallel mode: 0 workers");
    }
  }
}

/// Process cpu time (user + system) consumed so far.
fn cpu_time_now() -> Duration {
  match getrusage(UsageWho::RUSAGE_SELF) {
    Ok(usage) => {
      let user = usage.user_time();
      let sys = usage.system_time();
      let secs = (user.tv_sec() + sys.tv_sec()) as u64;
      let micros = (user.tv_usec() + sys.tv_usec()).max(0) as u64;
      Duration::from_secs(secs) + Duration::from_micros(micros)
    }
    Err(_) => Duration::ZERO,
  }
}

/// Host part of a `proto://host[:port]/path` style file name.
fn url_host(url: &str) -> String {
  let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
  let host = rest.split('/').next().unwrap_or(rest);
  host.split(':').next().unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::eval::Dataset;
  use crate::objects::WireObject;
  use crate::session::testutil::{read_shipment, worker_pair};

  #[test]
  fn cint_flushes_exactly_one_logdone() {
    let (mut session, mut peer) = worker_pair();
    peer
      .send(&Message::with_str(Tag::Cint, "let x = 1"))
      .unwrap();
    assert_eq!(session.handle_socket_input().unwrap(), Flow::Continue);
    let (_body, status, participants) = read_shipment(&mut peer);
    assert_eq!((status, participants), (0, 1));
    assert_eq!(session.ncmd, 1);
  }

  #[test]
  fn loglevel_then_status_observes_the_update() {
    let (mut session, mut peer) = worker_pair();

    peer.send(&Message::with_str(Tag::LogLevel, "3")).unwrap();
    session.handle_socket_input().unwrap();
    assert_eq!(session.log_level, 3);

    peer.send(&Message::new(Tag::Status)).unwrap();
    session.handle_socket_input().unwrap();
    let mut reply = peer.recv().unwrap();
    assert_eq!(reply.tag(), Some(Tag::Status));
    assert_eq!(reply.get_i64().unwrap(), 0);
    assert!(reply.get_f64().unwrap() >= 0.0);
    assert!(reply.get_f64().unwrap() >= 0.0);
    reply.get_str().unwrap();

    // Re-sending the same level changes nothing visible.
    peer.send(&Message::with_str(Tag::LogLevel, "3")).unwrap();
    session.handle_socket_input().unwrap();
    assert_eq!(session.log_level, 3);
  }

  #[test]
  fn stop_terminates_with_exit_zero() {
    let (mut session, mut peer) = worker_pair();
    peer.send(&Message::new(Tag::Stop)).unwrap();
    assert_eq!(session.handle_socket_input().unwrap(), Flow::Exit(0));
  }

  #[test]
  fn peer_close_terminates_with_exit_zero() {
    let (mut session, peer) = worker_pair();
    drop(peer);
    assert_eq!(session.handle_socket_input().unwrap(), Flow::Exit(0));
  }

  #[test]
  fn unknown_tags_are_survivable() {
    let (mut session, mut peer) = worker_pair();
    peer.send(&Message::with_str(Tag::Cint, "let a = 1")).unwrap();
    session.handle_socket_input().unwrap();
    read_shipment(&mut peer);

    // A tag from the future must not end the session.
    peer.send(&Message::new(Tag::Handshake)).unwrap();
    assert_eq!(session.handle_socket_input().unwrap(), Flow::Continue);
  }

  #[test]
  fn group_view_is_parsed_and_stored() {
    let (mut session, mut peer) = worker_pair();
    peer
      .send(&Message::with_str(Tag::GroupView, "2 8"))
      .unwrap();
    session.handle_socket_input().unwrap();
    assert_eq!((session.group_id, session.group_size), (2, 8));
  }

  #[test]
  fn tree_draw_tunes_the_named_dataset() {
    let (mut session, mut peer) = worker_pair();
    session.workspace.insert_dataset(Dataset::new("events", 100));
    peer
      .send(&Message::with_str(Tag::TreeDraw, "events 5000 250"))
      .unwrap();
    session.handle_socket_input().unwrap();
    let ds = session.workspace.dataset("events").unwrap();
    assert_eq!(ds.max_virtual_size(), 5000);
    assert_eq!(ds.estimate(), 250);
  }

  #[test]
  fn send_file_with_crlf_text_is_normalized() {
    let (mut session, mut peer) = worker_pair();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.prf");

    let payload = b"a\r\nb\r\nc\r\n";
    let announce = format!("{} 0 {}", path.display(), payload.len());
    peer
      .send(&Message::with_str(Tag::SendFile, &announce))
      .unwrap();
    peer.send_raw(payload, false).unwrap();

    session.handle_socket_input().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"a\nb\nc\n");
  }

  #[test]
  fn reset_restores_baseline_and_keeps_datasets() {
    let (mut session, mut peer) = worker_pair();
    session.workspace.insert_dataset(Dataset::new("events", 10));
    session.baseline = session.evaluator.snapshot();

    peer
      .send(&Message::with_str(Tag::Cint, "open(\"scratch\", \"rw\")"))
      .unwrap();
    session.handle_socket_input().unwrap();
    read_shipment(&mut peer);
    assert!(session.workspace.contains("scratch"));

    peer.send(&Message::with_str(Tag::Reset, "")).unwrap();
    session.handle_socket_input().unwrap();
    assert!(session.workspace.contains("events"));
    assert!(!session.workspace.contains("scratch"));
  }

  #[test]
  fn open_file_on_worker_evaluates_unconditionally() {
    let (mut session, mut peer) = worker_pair();
    let mut msg = Message::new(Tag::OpenFile);
    msg.put_str("local");
    msg.put_str("data.prf");
    msg.put_str("read");
    peer.send(&msg).unwrap();
    session.handle_socket_input().unwrap();
    let (_body, status, _) = read_shipment(&mut peer);
    assert_eq!(status, 0);
    assert!(matches!(
      session.workspace.fetch("data.prf"),
      Some(WireObject::Note(_))
    ));
  }

  #[test]
  fn master_remote_open_without_credentials_is_refused() {
    let (mut session, mut peer) = crate::session::testutil::master_pair();
    let mut msg = Message::new(Tag::OpenFile);
    msg.put_str("net");
    msg.put_str("proof://data.cern.ch/set.prf");
    msg.put_str("read");
    peer.send(&msg).unwrap();
    session.handle_socket_input().unwrap();
    // The flush still runs so the client sees the error line.
    let (_body, status, _) = read_shipment(&mut peer);
    assert_eq!(status, 0);
    assert!(session.workspace.fetch("proof://data.cern.ch/set.prf").is_none());
  }

  #[test]
  fn url_host_extraction() {
    assert_eq!(url_host("proof://data.cern.ch/set"), "data.cern.ch");
    assert_eq!(url_host("proof://node:3141/set"), "node");
    assert_eq!(url_host("plain.file"), "plain.file");
  }

  /// Scripted master: answers the worker's limits and packet requests for
  /// one `draw` command, then reads the log shipment.
  fn scripted_master(mut peer: crate::socket::CtrlSocket) -> std::thread::JoinHandle<Vec<(i64, i64)>> {
    std::thread::spawn(move || {
      peer
        .send(&Message::with_str(Tag::Cint, "draw events"))
        .unwrap();

      let mut ranges = Vec::new();
      loop {
        let mut msg = peer.recv().unwrap();
        match msg.tag() {
          Some(Tag::Limits) => {
            let dim = msg.get_i32().unwrap();
            let n = msg.get_i64().unwrap();
            let mut reply = Message::new(Tag::Limits);
            for _ in 0..dim {
              let bins = msg.get_i32().unwrap();
              let _ = msg.get_f64().unwrap();
              let _ = msg.get_f64().unwrap();
              reply.put_i32(bins);
              reply.put_f64(0.0);
              reply.put_f64(n as f64);
            }
            peer.send(&reply).unwrap();
          }
          Some(Tag::GetPacket) => {
            let first = ranges.last().map(|&(_, end)| end).unwrap_or(0);
            let count = if first < 300 { 100 } else { -1 };
            if count > 0 {
              ranges.push((first, first + count as i64));
            }
            let mut reply = Message::new(Tag::GetPacket);
            reply.put_i32(count);
            reply.put_i64(first);
            reply.put_i64(first);
            peer.send(&reply).unwrap();
          }
          Some(Tag::LogFile) => {
            let mut left = msg.get_i32().unwrap() as usize;
            let mut buf = [0u8; 4096];
            while left > 0 {
              let n = peer.recv_raw(&mut buf[..left.min(4096)], false).unwrap();
              left -= n;
            }
          }
          Some(Tag::LogDone) => {
            assert_eq!(msg.get_i32().unwrap(), 0);
            assert_eq!(msg.get_i32().unwrap(), 1);
            return ranges;
          }
          other => panic!("unexpected frame {other:?}"),
        }
      }
    })
  }

  #[test]
  fn parallel_draw_pulls_disjoint_packets_from_the_master() {
    let (mut session, peer) = worker_pair();
    session.workspace.insert_dataset(Dataset::new("events", 300));
    let master = scripted_master(peer);

    assert_eq!(session.handle_socket_input().unwrap(), Flow::Continue);

    let ranges = master.join().unwrap();
    assert_eq!(ranges, vec![(0, 100), (100, 200), (200, 300)]);
    assert_eq!(session.entries_processed, 300);
    match session.workspace.fetch("events_h") {
      Some(WireObject::Histogram(h)) => assert_eq!(h.entries, 300),
      other => panic!("expected histogram, got {other:?}"),
    }
  }

  #[test]
  fn two_pings_in_a_row_are_both_fine() {
    let (mut session, mut peer) = worker_pair();
    peer.send(&Message::new(Tag::Ping).with_ack()).unwrap();
    assert_eq!(session.handle_socket_input().unwrap(), Flow::Continue);
    peer.send(&Message::new(Tag::Ping).with_ack()).unwrap();
    assert_eq!(session.handle_socket_input().unwrap(), Flow::Continue);
    assert_eq!(session.ncmd, 2);
  }
}
