//! End-to-end session tests: spawn the real binary with the control
//! connection on descriptor 0, the way the launching daemon does, and speak
//! the wire protocol from the peer side.

use proofserv::protocol::{Message, Tag, deobfuscate_secret};
use proofserv::socket::CtrlSocket;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};

fn spawn_session(role: &str, confdir: &std::path::Path, home: &std::path::Path) -> (Child, CtrlSocket) {
  let (ours, theirs) = UnixStream::pair().unwrap();
  let child = Command::new(env!("CARGO_BIN_EXE_proofserv"))
    .arg(role)
    .arg(confdir)
    .env("HOME", home)
    .stdin(Stdio::from(OwnedFd::from(theirs)))
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .spawn()
    .expect("spawn proofserv");
  (child, CtrlSocket::from_unix(ours))
}

fn expect_greeting(sock: &mut CtrlSocket) -> String {
  let mut msg = sock.recv().unwrap();
  assert_eq!(msg.tag(), Some(Tag::String));
  msg.get_str().unwrap()
}

fn worker_handshake(sock: &mut CtrlSocket, user: &str, protocol: i32, ordinal: i32) {
  let mut hs = Message::new(Tag::Handshake);
  hs.put_str(user);
  hs.put_i32(protocol);
  hs.put_i32(ordinal);
  sock.send(&hs).unwrap();
}

fn master_handshake(sock: &mut CtrlSocket, user: &str, secret: &str, conffile: &str, protocol: i32) {
  let mut obfuscated = secret.as_bytes().to_vec();
  deobfuscate_secret(&mut obfuscated); // NOT is its own inverse
  let mut hs = Message::new(Tag::Handshake);
  hs.put_str(user);
  hs.put_blob(&obfuscated);
  hs.put_str(conffile);
  hs.put_i32(protocol);
  sock.send(&hs).unwrap();
}

/// Reads one log shipment: raw bytes plus `LOGDONE{status, participants}`.
fn read_shipment(sock: &mut CtrlSocket) -> (Vec<u8>, i32, i32) {
  let mut body = Vec::new();
  loop {
    let mut msg = sock.recv().unwrap();
    match msg.tag() {
      Some(Tag::LogFile) => {
        let mut left = msg.get_i32().unwrap() as usize;
        let mut buf = [0u8; 4096];
        while left > 0 {
          let n = sock.recv_raw(&mut buf[..left.min(4096)], false).unwrap();
          assert!(n > 0, "log stream ended early");
          body.extend_from_slice(&buf[..n]);
          left -= n;
        }
      }
      Some(Tag::LogDone) => {
        let status = msg.get_i32().unwrap();
        let participants = msg.get_i32().unwrap();
        return (body, status, participants);
      }
      other => panic!("unexpected frame {other:?}"),
    }
  }
}

#[test]
fn worker_session_serves_commands_and_stops() {
  let confdir = tempfile::tempdir().unwrap();
  let home = tempfile::tempdir().unwrap();
  let (mut child, mut sock) = spawn_session("proofslave", confdir.path(), home.path());

  let greeting = expect_greeting(&mut sock);
  assert!(greeting.contains("PROOF slave server"), "greeting: {greeting}");
  worker_handshake(&mut sock, "tester", 7, 0);

  // A quiet command still yields exactly one terminator.
  sock.send(&Message::with_str(Tag::Cint, "let x = 2")).unwrap();
  let (_body, status, participants) = read_shipment(&mut sock);
  assert_eq!((status, participants), (0, 1));

  // Print output travels through the redirected log.
  sock.send(&Message::with_str(Tag::Print, "")).unwrap();
  let (body, status, _) = read_shipment(&mut sock);
  assert_eq!(status, 0);
  assert!(String::from_utf8_lossy(&body).contains("This is slave 0"));

  // The log file landed in the session workspace.
  let logs: Vec<_> = std::fs::read_dir(home.path().join("proof"))
    .unwrap()
    .flatten()
    .map(|e| e.file_name().to_string_lossy().into_owned())
    .filter(|n| n.starts_with("proofs0_") && n.ends_with(".log"))
    .collect();
  assert_eq!(logs.len(), 1);

  sock.send(&Message::new(Tag::Stop)).unwrap();
  let status = child.wait().unwrap();
  assert_eq!(status.code(), Some(0));
}

#[test]
fn master_cold_start_ships_the_banner() {
  let confdir = tempfile::tempdir().unwrap();
  let etc = confdir.path().join("proof").join("etc");
  std::fs::create_dir_all(&etc).unwrap();
  std::fs::write(etc.join("banner"), "welcome to the cluster\n").unwrap();
  let home = tempfile::tempdir().unwrap();

  let (mut child, mut sock) = spawn_session("proofserv", confdir.path(), home.path());
  let greeting = expect_greeting(&mut sock);
  assert!(greeting.contains("Welcome to the PROOF server"));
  master_handshake(&mut sock, "tester", "hunter2", "", 7);

  // First shipment carries the banner; no workers are configured.
  let (body, status, participants) = read_shipment(&mut sock);
  assert!(String::from_utf8_lossy(&body).contains("welcome to the cluster"));
  assert_eq!((status, participants), (0, 0));
  assert!(home.path().join("proof").join(".last-banner").exists());

  sock.send(&Message::new(Tag::Stop)).unwrap();
  assert_eq!(child.wait().unwrap().code(), Some(0));
}

#[test]
fn closed_banner_ends_the_session_with_status_minus_99() {
  let confdir = tempfile::tempdir().unwrap();
  let etc = confdir.path().join("proof").join("etc");
  std::fs::create_dir_all(&etc).unwrap();
  std::fs::write(etc.join("closed-banner"), "maintenance\n").unwrap();
  let home = tempfile::tempdir().unwrap();

  let (mut child, mut sock) = spawn_session("proofserv", confdir.path(), home.path());
  expect_greeting(&mut sock);
  master_handshake(&mut sock, "tester", "hunter2", "", 7);

  let (body, status, _participants) = read_shipment(&mut sock);
  assert!(String::from_utf8_lossy(&body).contains("maintenance"));
  assert_eq!(status, -99);
  assert_eq!(child.wait().unwrap().code(), Some(0));
}

#[test]
fn peer_disconnect_terminates_the_worker_cleanly() {
  let confdir = tempfile::tempdir().unwrap();
  let home = tempfile::tempdir().unwrap();
  let (mut child, mut sock) = spawn_session("proofslave", confdir.path(), home.path());
  expect_greeting(&mut sock);
  worker_handshake(&mut sock, "tester", 7, 1);

  // One command to make sure the loop is up, then drop the connection.
  sock.send(&Message::with_str(Tag::Cint, "let a = 1")).unwrap();
  read_shipment(&mut sock);
  drop(sock);

  assert_eq!(child.wait().unwrap().code(), Some(0));
}
