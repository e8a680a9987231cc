//! Message-of-the-day banner for masters.
//!
//! Resolution order: a `closed-banner` file shuts the service down after its
//! contents are shown; otherwise `banner` is shown when it changed since the
//! last visit or when the last visit is more than a day old. The visit
//! timestamp is always refreshed.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

const DAY: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Banner {
  Open,
  /// The closed banner was shown; the session must terminate.
  Closed,
}

/// Prints the applicable banner to the (already redirected) stdout and
/// touches the throttle file.
pub fn cat_banner(conf_dir: &Path, work_dir: &Path) -> io::Result<Banner> {
  let etc = conf_dir.join("proof").join("etc");

  let closed = etc.join("closed-banner");
  if closed.exists() {
    let text = fs::read_to_string(&closed)?;
    println!();
    print!("{text}");
    println!();
    return Ok(Banner::Closed);
  }

  let last = work_dir.join(".last-banner");
  let last_mtime = fs::metadata(&last).and_then(|m| m.modified()).ok();

  let banner = etc.join("banner");
  let banner_mtime = fs::metadata(&banner).and_then(|m| m.modified()).ok();

  if should_show(banner_mtime, last_mtime, SystemTime::now()) {
    let text = fs::read_to_string(&banner)?;
    println!();
    print!("{text}");
    println!();
  }

  // Refresh the throttle timestamp whether or not the banner was shown.
  fs::File::create(&last)?;

  Ok(Banner::Open)
}

/// Show when the banner exists and either changed since the last visit or
/// the last visit is outside the 24-hour sliding window.
fn should_show(
  banner_mtime: Option<SystemTime>,
  last_mtime: Option<SystemTime>,
  now: SystemTime,
) -> bool {
  let Some(banner_mtime) = banner_mtime else {
    return false;
  };
  let Some(last_mtime) = last_mtime else {
    return true;
  };
  if banner_mtime > last_mtime {
    return true;
  }
  now.duration_since(last_mtime).unwrap_or_default() > DAY
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn no_banner_file_never_shows() {
    assert!(!should_show(None, None, SystemTime::now()));
  }

  #[test]
  fn first_visit_shows() {
    assert!(should_show(Some(SystemTime::now()), None, SystemTime::now()));
  }

  #[test]
  fn unchanged_banner_within_a_day_is_suppressed() {
    let now = SystemTime::now();
    let banner = now - Duration::from_secs(7_200);
    let last = now - Duration::from_secs(3_600);
    assert!(!should_show(Some(banner), Some(last), now));
  }

  #[test]
  fn unchanged_banner_after_a_day_shows_again() {
    let now = SystemTime::now();
    let banner = now - Duration::from_secs(200_000);
    let last = now - Duration::from_secs(90_000);
    assert!(should_show(Some(banner), Some(last), now));
  }

  #[test]
  fn touched_banner_shows_immediately() {
    let now = SystemTime::now();
    let last = now - Duration::from_secs(60);
    let banner = now - Duration::from_secs(1);
    assert!(should_show(Some(banner), Some(last), now));
  }

  #[test]
  fn closed_banner_wins_and_terminates() {
    let conf = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let etc = conf.path().join("proof").join("etc");
    fs::create_dir_all(&etc).unwrap();
    fs::write(etc.join("closed-banner"), "maintenance\n").unwrap();
    fs::write(etc.join("banner"), "welcome\n").unwrap();
    assert_eq!(
      cat_banner(conf.path(), work.path()).unwrap(),
      Banner::Closed
    );
    // The throttle file is only touched on the open path.
    assert!(!work.path().join(".last-banner").exists());
  }

  #[test]
  fn open_path_touches_throttle_file() {
    let conf = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    fs::create_dir_all(conf.path().join("proof").join("etc")).unwrap();
    assert_eq!(cat_banner(conf.path(), work.path()).unwrap(), Banner::Open);
    assert!(work.path().join(".last-banner").exists());
  }
}
