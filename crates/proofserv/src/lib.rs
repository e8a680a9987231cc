use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

pub mod banner;
pub mod config;
pub mod eval;
pub mod event;
pub mod fleet;
pub mod logstream;
pub mod objects;
pub mod protocol;
pub mod reporter;
pub mod session;
pub mod socket;
pub mod syslog;
pub mod transfer;

use crate::eval::{CommandEvaluator, NetrcProbe};
use crate::session::{Bootstrap, Role, Session};
use crate::socket::CtrlSocket;

/// proofserv - PROOF-style parallel compute session server.
///
/// Launched by the cluster daemon with an authenticated control connection
/// on descriptor 0.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  /// Role this process serves.
  pub role: RoleTag,
  /// Cluster configuration directory.
  pub confdir: PathBuf,
  /// Skip the logon script from the configuration.
  #[arg(long)]
  pub no_logon: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleTag {
  /// Master session serving one client.
  #[value(name = "proofserv")]
  Master,
  /// Worker session serving one master.
  #[value(name = "proofslave")]
  Worker,
}

impl From<RoleTag> for Role {
  fn from(tag: RoleTag) -> Role {
    match tag {
      RoleTag::Master => Role::Master,
      RoleTag::Worker => Role::Worker,
    }
  }
}

/// Parses the launch arguments, adopts the inherited control connection and
/// runs the session to completion. Returns the process exit code.
pub fn run() -> Result<i32> {
  let _ = env_logger::try_init();
  let cli = Cli::parse();

  // The launching daemon hands us the authenticated connection on fd 0.
  let socket = unsafe { CtrlSocket::from_inherited(0) };
  let evaluator = Box::new(CommandEvaluator::new());
  let auth = Box::new(NetrcProbe::from_home());

  match Session::bootstrap(
    cli.role.into(),
    cli.confdir,
    cli.no_logon,
    socket,
    evaluator,
    auth,
  )? {
    Bootstrap::Closed => Ok(0),
    Bootstrap::Ready(mut session) => session.run(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn role_tags_match_the_launch_contract() {
    let cli = Cli::try_parse_from(["proofserv", "proofserv", "/etc/cluster"]).unwrap();
    assert!(matches!(cli.role, RoleTag::Master));
    assert!(!cli.no_logon);

    let cli =
      Cli::try_parse_from(["proofserv", "proofslave", "/etc/cluster", "--no-logon"]).unwrap();
    assert!(matches!(cli.role, RoleTag::Worker));
    assert!(cli.no_logon);

    assert!(Cli::try_parse_from(["proofserv", "something-else", "/etc"]).is_err());
  }
}
