//! Session controller: bootstrap, event loop and lifecycle.
//!
//! One `Session` serves exactly one client (master role) or one master
//! (worker role) over the control socket inherited on descriptor 0. The
//! bootstrap order is part of the protocol contract and is fixed:
//! greeting, handshake, workspace setup, log redirection, banner (masters),
//! startup scripts, evaluator baseline, signal handlers, fleet start
//! (masters), initial log shipment, event loop.
//!
//! The session is a plain value threaded through its handlers; the only
//! process-global access point lives at the error-reporter boundary.

mod dispatch;
mod interrupt;
mod packets;

pub use packets::RemoteLink;

use crate::banner::{Banner, cat_banner};
use crate::config::SessionConfig;
use crate::eval::{AuthProbe, EvalContext, Evaluator, LocalLink, Snapshot, Workspace};
use crate::event::{EventLoop, SignalFlags, Wakeup};
use crate::fleet::Fleet;
use crate::logstream::LogStream;
use crate::protocol::{Message, Tag, deobfuscate_secret};
use crate::reporter::{self, Severity};
use crate::socket::CtrlSocket;
use crate::syslog;
use anyhow::{Context, Result};
use log::debug;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Session role. Masters fan out to workers and aggregate; workers execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Master,
  Worker,
}

impl Role {
  pub fn is_master(self) -> bool {
    matches!(self, Role::Master)
  }

  /// Syslog ident, also the launch role-tag.
  pub fn service_ident(self) -> &'static str {
    match self {
      Role::Master => "proofserv",
      Role::Worker => "proofslave",
    }
  }

  fn facility(self) -> syslog::Facility {
    match self {
      Role::Master => syslog::Facility::Local5,
      Role::Worker => syslog::Facility::Local6,
    }
  }
}

/// What a handler tells the event loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
  Continue,
  Exit(i32),
}

/// Outcome of the bootstrap phase.
pub enum Bootstrap {
  Ready(Box<Session>),
  /// The closed banner was shipped; terminate with exit 0.
  Closed,
}

pub struct Session {
  role: Role,
  ordinal: i32,
  protocol: i32,
  user: String,
  /// De-obfuscated handshake secret, kept for outward authentication.
  secret: String,
  conf_dir: PathBuf,
  conf_file: String,
  work_dir: PathBuf,
  log_level: i32,
  ncmd: u64,
  real_time: Duration,
  cpu_time: Duration,
  /// Cooperative soft-interrupt flag polled by the evaluator.
  interrupt: AtomicBool,
  group_id: i32,
  group_size: i32,
  /// Worker-side packet cursor: entries processed so far per the master.
  entries_processed: i64,
  socket: CtrlSocket,
  log: LogStream,
  events: EventLoop,
  evaluator: Box<dyn Evaluator>,
  workspace: Workspace,
  auth: Box<dyn AuthProbe>,
  fleet: Option<Fleet>,
  config: SessionConfig,
  baseline: Snapshot,
}

impl Session {
  /// Runs the fixed bootstrap sequence and returns a session ready for its
  /// event loop, or `Closed` when the closed banner ended the service.
  pub fn bootstrap(
    role: Role,
    conf_dir: PathBuf,
    no_logon: bool,
    mut socket: CtrlSocket,
    mut evaluator: Box<dyn Evaluator>,
    auth: Box<dyn AuthProbe>,
  ) -> Result<Bootstrap> {
    // Greeting, then the role-dependent handshake.
    let host = hostname();
    let greeting = match role {
      Role::Master => format!("**** Welcome to the PROOF server @ {host} ****"),
      Role::Worker => format!("**** PROOF slave server @ {host} started ****"),
    };
    socket
      .send(&Message::with_str(Tag::String, &greeting))
      .context("send greeting")?;

    let mut hs = socket.recv().context("read session handshake")?;
    let user;
    let mut secret = String::new();
    let mut conf_file = String::new();
    let protocol;
    let mut ordinal = -1;
    match role {
      Role::Master => {
        user = hs.get_str()?;
        let mut obfuscated = hs.get_blob()?;
        deobfuscate_secret(&mut obfuscated);
        secret = String::from_utf8(obfuscated).unwrap_or_default();
        conf_file = hs.get_str()?;
        protocol = hs.get_i32()?;
      }
      Role::Worker => {
        user = hs.get_str()?;
        protocol = hs.get_i32()?;
        ordinal = hs.get_i32()?;
      }
    }
    reporter::set_user(&user);

    // Session workspace under the home directory the launcher exported.
    let home = env::var_os("HOME")
      .map(PathBuf::from)
      .unwrap_or_else(env::temp_dir);
    let work_dir = home.join("proof");
    prepare_work_dir(&work_dir)?;

    // Deny write access for group and world.
    unsafe { libc::umask(0o022) };

    syslog::open(
      role.service_ident(),
      syslog::Options::PID | syslog::Options::CONS,
      role.facility(),
    );

    // Re-export the environment the evaluator and child tools see.
    unsafe {
      env::set_var("HOME", &home);
      env::set_var("PATH", "/bin:/usr/bin:/usr/contrib/bin:/usr/local/bin");
    }

    // Incoming urgent data must raise SIGURG at this process; small frames
    // go out immediately; keep-alive probes detect a dead peer.
    if let Err(e) = socket.set_owner_process(std::process::id() as i32) {
      reporter::sys_report("setup", "cannot own urgent-data signal", &e);
    }
    let _ = socket.set_no_delay();
    if let Err(e) = socket.set_keep_alive() {
      debug!("keep-alive not available: {e}");
    }

    let config = SessionConfig::load_from(&conf_dir, &conf_file)?;

    // Free the stdio range, then bind it to the session log.
    socket.rebind_above_stdio().context("rebind control socket")?;
    reporter::set_fatal_peer(socket.as_raw_fd());
    let mut log = LogStream::create(&work_dir, role, ordinal, std::process::id())
      .context("create session log")?;
    log.redirect_stdio().context("redirect stdio into log")?;

    if role.is_master() {
      match cat_banner(&conf_dir, &work_dir)? {
        Banner::Closed => {
          let participants = config.master.workers.len() as i32;
          let _ = log.ship(&mut socket, -99, participants);
          return Ok(Bootstrap::Closed);
        }
        Banner::Open => {}
      }
    }

    // Startup and logon scripts run before any handler can fire; what they
    // leave behind becomes the baseline that RESET restores.
    let mut workspace = Workspace::new();
    let interrupt = AtomicBool::new(false);
    source_startup_scripts(
      &mut *evaluator,
      &mut workspace,
      &interrupt,
      &conf_dir,
      &config,
      no_logon,
    );
    let baseline = evaluator.snapshot();

    // Only now do the interrupt and input handlers go live.
    let signals = SignalFlags::install()?;
    let events = EventLoop::new(signals);

    let mut session = Box::new(Session {
      role,
      ordinal,
      protocol,
      user,
      secret,
      conf_dir,
      conf_file,
      work_dir,
      log_level: 1,
      ncmd: 0,
      real_time: Duration::ZERO,
      cpu_time: Duration::ZERO,
      interrupt,
      group_id: -1,
      group_size: 0,
      entries_processed: 0,
      socket,
      log,
      events,
      evaluator,
      workspace,
      auth,
      fleet: None,
      config,
      baseline,
    });

    if session.role.is_master() {
      let master_url = format!("proof://__master__:{}", local_port(&session.socket));
      session.fleet = Some(Fleet::connect(
        &session.config.master,
        &session.user,
        session.protocol,
        &master_url,
        session.log_level,
      ));
      // Ship the banner and fleet startup output to the client.
      session.send_log(0).context("ship initial log")?;
    }

    Ok(Bootstrap::Ready(session))
  }

  /// Main server event loop; returns the process exit code.
  pub fn run(&mut self) -> Result<i32> {
    loop {
      let wake = self.events.wait(self.socket.as_fd())?;
      let flow = match wake {
        Wakeup::SocketReady => self.handle_socket_input()?,
        Wakeup::UrgentSignal => self.handle_urgent_data()?,
        Wakeup::PipeSignal => self.handle_sig_pipe()?,
        Wakeup::Idle => Flow::Continue,
      };
      if let Flow::Exit(code) = flow {
        return Ok(code);
      }
    }
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub(crate) fn is_master(&self) -> bool {
    self.role.is_master()
  }

  /// Participant count carried in `LOGDONE`: active workers on a master,
  /// one on a worker.
  fn participants(&self) -> i32 {
    match self.role {
      Role::Master => self
        .fleet
        .as_ref()
        .map(|f| f.active_count())
        .unwrap_or(self.config.master.workers.len() as i32),
      Role::Worker => 1,
    }
  }

  /// Ships the unseen log suffix and the `LOGDONE` terminator.
  pub(crate) fn send_log(&mut self, status: i32) -> std::io::Result<()> {
    let participants = self.participants();
    let Session { log, socket, .. } = self;
    log.ship(socket, status, participants)
  }

}

/// Sources the configured startup and logon scripts. Failures are reported,
/// not fatal: a broken logon script must not take the whole cluster session
/// down.
fn source_startup_scripts(
  evaluator: &mut dyn Evaluator,
  workspace: &mut Workspace,
  interrupt: &AtomicBool,
  conf_dir: &Path,
  config: &SessionConfig,
  no_logon: bool,
) {
  let scripts_dir = conf_dir.join("proof").join("etc");
  if let Some(name) = &config.load {
    source_script(evaluator, workspace, interrupt, &resolve_script(&scripts_dir, name));
  }
  if !no_logon {
    if let Some(name) = &config.logon {
      source_script(evaluator, workspace, interrupt, &resolve_script(&scripts_dir, name));
    }
  }
}

fn source_script(
  evaluator: &mut dyn Evaluator,
  workspace: &mut Workspace,
  interrupt: &AtomicBool,
  path: &Path,
) {
  if !path.exists() {
    return;
  }
  let mut link = LocalLink::new();
  let mut ctx = EvalContext {
    workspace,
    link: &mut link,
    interrupt,
  };
  if let Err(e) = evaluator.process_file(path, &mut ctx) {
    reporter::report(
      Severity::Error,
      "startup",
      &format!("error in {}: {e:#}", path.display()),
    );
  }
}

fn resolve_script(scripts_dir: &Path, name: &str) -> PathBuf {
  let path = Path::new(name);
  if path.is_absolute() {
    path.to_path_buf()
  } else {
    scripts_dir.join(name)
  }
}

/// Creates and enters the session working directory, replacing a blocking
/// plain file if a previous run left one behind.
fn prepare_work_dir(dir: &Path) -> Result<()> {
  if fs::create_dir_all(dir).is_err() {
    let _ = fs::remove_file(dir);
    fs::create_dir_all(dir)
      .with_context(|| format!("create working directory {}", dir.display()))?;
  }
  env::set_current_dir(dir)
    .with_context(|| format!("enter working directory {}", dir.display()))
}

fn hostname() -> String {
  nix::unistd::gethostname()
    .map(|h| h.to_string_lossy().into_owned())
    .unwrap_or_else(|_| "localhost".to_string())
}

/// Port the control socket is bound to locally; 0 on non-TCP transports.
fn local_port(socket: &CtrlSocket) -> u16 {
  socket2::SockRef::from(&socket.as_fd())
    .local_addr()
    .ok()
    .and_then(|addr| addr.as_socket())
    .map(|addr| addr.port())
    .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod testutil {
  use super::*;
  use crate::eval::{CommandEvaluator, NetrcProbe};
  use std::net::{TcpListener, TcpStream};
  use std::os::unix::net::UnixStream;

  /// Builds a session wired to one end of a socketpair, without touching
  /// process-global state (no stdio redirect, no chdir).
  pub(crate) fn session_over(sock: CtrlSocket, role: Role, ordinal: i32) -> Session {
    let dir = tempfile::tempdir().unwrap();
    let log = LogStream::create(dir.path(), role, ordinal, std::process::id()).unwrap();
    // Leak the tempdir so the log file outlives the helper.
    std::mem::forget(dir);
    Session {
      role,
      ordinal,
      protocol: 7,
      user: "alice".to_string(),
      secret: String::new(),
      conf_dir: PathBuf::from("/nonexistent"),
      conf_file: String::new(),
      work_dir: PathBuf::from("/nonexistent"),
      log_level: 1,
      ncmd: 0,
      real_time: Duration::ZERO,
      cpu_time: Duration::ZERO,
      interrupt: AtomicBool::new(false),
      group_id: -1,
      group_size: 0,
      entries_processed: 0,
      socket: sock,
      log,
      events: EventLoop::new(SignalFlags::fake()),
      evaluator: Box::new(CommandEvaluator::new()),
      workspace: Workspace::new(),
      auth: Box::new(NetrcProbe::with_path(Path::new("/nonexistent/netrc"))),
      fleet: None,
      config: SessionConfig::default(),
      baseline: Snapshot::default(),
    }
  }

  pub(crate) fn worker_pair() -> (Session, CtrlSocket) {
    let (a, b) = UnixStream::pair().unwrap();
    (
      session_over(CtrlSocket::from_unix(a), Role::Worker, 0),
      CtrlSocket::from_unix(b),
    )
  }

  pub(crate) fn master_pair() -> (Session, CtrlSocket) {
    let (a, b) = UnixStream::pair().unwrap();
    (
      session_over(CtrlSocket::from_unix(a), Role::Master, -1),
      CtrlSocket::from_unix(b),
    )
  }

  /// TCP variant for tests that need real out-of-band data.
  pub(crate) fn worker_tcp_pair() -> (Session, CtrlSocket) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let a = TcpStream::connect(addr).unwrap();
    let (b, _) = listener.accept().unwrap();
    (
      session_over(CtrlSocket::from_tcp(a), Role::Worker, 0),
      CtrlSocket::from_tcp(b),
    )
  }

  /// Reads one log shipment from the peer side: raw bytes plus the
  /// `LOGDONE{status, participants}` terminator.
  pub(crate) fn read_shipment(sock: &mut CtrlSocket) -> (Vec<u8>, i32, i32) {
    let mut body = Vec::new();
    loop {
      let mut msg = sock.recv().unwrap();
      match msg.tag() {
        Some(Tag::LogFile) => {
          let mut left = msg.get_i32().unwrap() as usize;
          let mut buf = [0u8; 4096];
          while left > 0 {
            let n = sock.recv_raw(&mut buf[..left.min(4096)], false).unwrap();
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
}
