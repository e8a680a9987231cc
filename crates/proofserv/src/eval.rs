//! Evaluator and dataset collaborators.
//!
//! The embedded interpreter is an opaque collaborator behind the
//! [`Evaluator`] trait: the session hands it command lines plus an
//! [`EvalContext`] giving access to the workspace, the packet source and the
//! cooperative interrupt flag, and asks for global-state snapshots around
//! `RESET`. The bundled [`CommandEvaluator`] interprets a small command
//! language sufficient to drive datasets end to end; cluster deployments
//! swap in their own interpreter at the same seam.
//!
//! The workspace is the per-session object directory. `RESET` destroys every
//! non-dataset object and keeps datasets, so repeated commands can reuse
//! loaded data.

use crate::objects::{Histogram, Note, WireObject};
use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// A contiguous half-open range of dataset entries assigned for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
  pub first: i64,
  pub count: i64,
}

/// One histogram axis: bin count plus the value range. A range with
/// `vmax <= vmin` is deferred and resolved by the link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimits {
  pub bins: i32,
  pub vmin: f64,
  pub vmax: f64,
}

/// Resolves a deferred axis range against the dataset entry count. Both the
/// local link and the master's limits handler apply the same rule, so a
/// command behaves identically with and without a fleet.
pub fn resolve_axis(total_entries: i64, axis: &mut AxisLimits) {
  if axis.vmax <= axis.vmin {
    axis.vmin = 0.0;
    axis.vmax = total_entries.max(1) as f64;
  }
}

/// The evaluator's channel toward whoever coordinates the work.
///
/// Workers talk to their master over the control connection; a non-parallel
/// session answers itself. Packet requests alternate strictly with replies.
pub trait MasterLink {
  /// Next range of entries to process; `None` means the work is exhausted.
  /// `total_entries` sizes local distribution and is ignored remotely.
  fn next_packet(&mut self, total_entries: i64) -> Result<Option<Packet>>;

  /// Fetches an object by `"name;cycle"` from the coordinator, if it has one.
  fn fetch_object(&mut self, namecycle: &str) -> Result<Option<WireObject>>;

  /// Resolves deferred axis limits. `n` is the entry count the histogram
  /// will cover.
  fn fetch_limits(&mut self, n: i64, axes: &mut [AxisLimits]) -> Result<()>;
}

/// Link for local evaluation: the whole dataset arrives as a single packet
/// and there is no remote object directory.
pub struct LocalLink {
  served: bool,
}

impl LocalLink {
  pub fn new() -> Self {
    Self { served: false }
  }
}

impl Default for LocalLink {
  fn default() -> Self {
    Self::new()
  }
}

impl MasterLink for LocalLink {
  fn next_packet(&mut self, total_entries: i64) -> Result<Option<Packet>> {
    if self.served || total_entries <= 0 {
      return Ok(None);
    }
    self.served = true;
    Ok(Some(Packet {
      first: 0,
      count: total_entries,
    }))
  }

  fn fetch_object(&mut self, _namecycle: &str) -> Result<Option<WireObject>> {
    Ok(None)
  }

  fn fetch_limits(&mut self, n: i64, axes: &mut [AxisLimits]) -> Result<()> {
    for axis in axes {
      resolve_axis(n, axis);
    }
    Ok(())
  }
}

/// A tabular dataset: entry count, ranged scans and the two tuning knobs.
#[derive(Debug, Clone)]
pub struct Dataset {
  name: String,
  entries: i64,
  bytes_read: u64,
  max_virtual_size: i64,
  estimate: i64,
}

impl Dataset {
  pub fn new(name: &str, entries: i64) -> Self {
    Self {
      name: name.to_string(),
      entries,
      bytes_read: 0,
      max_virtual_size: -1,
      estimate: 1_000_000,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn entries(&self) -> i64 {
    self.entries
  }

  pub fn bytes_read(&self) -> u64 {
    self.bytes_read
  }

  pub fn set_max_virtual_size(&mut self, v: i64) {
    self.max_virtual_size = v;
  }

  pub fn set_estimate(&mut self, v: i64) {
    self.estimate = v;
  }

  pub fn max_virtual_size(&self) -> i64 {
    self.max_virtual_size
  }

  pub fn estimate(&self) -> i64 {
    self.estimate
  }

  /// Scans `[first, first+count)`, clamped to the dataset, and accounts the
  /// bytes touched. Returns the number of entries actually read.
  pub fn scan_range(&mut self, first: i64, count: i64) -> i64 {
    let first = first.clamp(0, self.entries);
    let last = (first + count.max(0)).min(self.entries);
    let read = last - first;
    self.bytes_read += (read as u64) * 8;
    read
  }
}

/// One named entry in the session workspace.
pub enum WorkObject {
  Dataset(Dataset),
  Value(WireObject),
}

/// Per-session object directory.
#[derive(Default)]
pub struct Workspace {
  objects: BTreeMap<String, WorkObject>,
}

impl Workspace {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert_dataset(&mut self, ds: Dataset) {
    self.objects.insert(ds.name().to_string(), WorkObject::Dataset(ds));
  }

  pub fn insert_value(&mut self, obj: WireObject) {
    self
      .objects
      .insert(obj.name().to_string(), WorkObject::Value(obj));
  }

  pub fn dataset_mut(&mut self, name: &str) -> Option<&mut Dataset> {
    match self.objects.get_mut(name) {
      Some(WorkObject::Dataset(ds)) => Some(ds),
      _ => None,
    }
  }

  pub fn dataset(&self, name: &str) -> Option<&Dataset> {
    match self.objects.get(name) {
      Some(WorkObject::Dataset(ds)) => Some(ds),
      _ => None,
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.objects.contains_key(name)
  }

  /// Looks up a shippable value by `"name;cycle"`; the cycle suffix is
  /// accepted and ignored. Datasets are not shippable.
  pub fn fetch(&self, namecycle: &str) -> Option<&WireObject> {
    let name = namecycle.split(';').next().unwrap_or(namecycle);
    match self.objects.get(name) {
      Some(WorkObject::Value(v)) => Some(v),
      _ => None,
    }
  }

  /// Destroys every object that is not a dataset.
  pub fn reset_keep_datasets(&mut self) {
    self
      .objects
      .retain(|_, obj| matches!(obj, WorkObject::Dataset(_)));
  }

  /// Bytes read from datasets since the session started.
  pub fn total_bytes_read(&self) -> u64 {
    self
      .objects
      .values()
      .map(|obj| match obj {
        WorkObject::Dataset(ds) => ds.bytes_read(),
        WorkObject::Value(_) => 0,
      })
      .sum()
  }
}

/// Everything a command evaluation may touch.
pub struct EvalContext<'a> {
  pub workspace: &'a mut Workspace,
  pub link: &'a mut dyn MasterLink,
  pub interrupt: &'a AtomicBool,
}

/// Saved evaluator global state, restored by `RESET`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
  globals: BTreeMap<String, f64>,
  loaded: Vec<String>,
}

/// The embedded script interpreter seam.
pub trait Evaluator {
  fn process_line(&mut self, line: &str, ctx: &mut EvalContext<'_>) -> Result<()>;
  fn process_file(&mut self, path: &Path, ctx: &mut EvalContext<'_>) -> Result<()>;
  fn snapshot(&self) -> Snapshot;
  fn restore(&mut self, snap: &Snapshot);
}

const HISTOGRAM_BINS: usize = 10;

/// Built-in evaluator for the session command language:
///
/// - `let <name> = <number>` assigns a global,
/// - `print <name>` prints a global,
/// - `load <name> <entries>` registers a dataset,
/// - `draw <dataset>` processes the dataset packet by packet into a
///   histogram named `<dataset>_h`,
/// - `fetch <name>` pulls an object from the coordinator's directory,
/// - `open("<file>", "<options>")` records an open-file note,
/// - lines starting with `#` are comments.
#[derive(Default)]
pub struct CommandEvaluator {
  globals: BTreeMap<String, f64>,
  loaded: Vec<String>,
}

impl CommandEvaluator {
  pub fn new() -> Self {
    Self::default()
  }

  fn draw(&mut self, name: &str, ctx: &mut EvalContext<'_>) -> Result<()> {
    let entries = match ctx.workspace.dataset(name) {
      Some(ds) => ds.entries(),
      None => bail!("no dataset named '{name}'"),
    };
    let mut axis = AxisLimits {
      bins: HISTOGRAM_BINS as i32,
      vmin: 0.0,
      vmax: -1.0,
    };
    ctx.link.fetch_limits(entries, std::slice::from_mut(&mut axis))?;
    let width = ((axis.vmax - axis.vmin) / axis.bins.max(1) as f64).max(1.0);
    let mut bins = vec![0.0; axis.bins.max(1) as usize];
    let mut processed: i64 = 0;

    while let Some(packet) = ctx.link.next_packet(entries)? {
      if ctx.interrupt.load(Ordering::Relaxed) {
        bail!("interrupted while processing '{name}'");
      }
      let ds = ctx
        .workspace
        .dataset_mut(name)
        .ok_or_else(|| anyhow::anyhow!("dataset '{name}' vanished mid-draw"))?;
      let read = ds.scan_range(packet.first, packet.count);
      processed += read;
      // Entry i falls in bin (i - vmin)/width; add each range's overlap.
      for (b, bin) in bins.iter_mut().enumerate() {
        let lo = (axis.vmin + b as f64 * width).max(packet.first as f64);
        let hi = (axis.vmin + (b + 1) as f64 * width).min((packet.first + read) as f64);
        if hi > lo {
          *bin += hi - lo;
        }
      }
    }

    ctx.workspace.insert_value(WireObject::Histogram(Histogram {
      name: format!("{name}_h"),
      bins,
      entries: processed,
    }));
    println!("{name}: {processed} entries processed");
    Ok(())
  }
}

impl Evaluator for CommandEvaluator {
  fn process_line(&mut self, line: &str, ctx: &mut EvalContext<'_>) -> Result<()> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      return Ok(());
    }

    if let Some(rest) = line.strip_prefix("let ") {
      let Some((name, value)) = rest.split_once('=') else {
        bail!("expected 'let <name> = <number>'");
      };
      let value: f64 = value.trim().parse()?;
      self.globals.insert(name.trim().to_string(), value);
      return Ok(());
    }

    if let Some(name) = line.strip_prefix("print ") {
      match self.globals.get(name.trim()) {
        Some(v) => println!("{} = {}", name.trim(), v),
        None => println!("{} is undefined", name.trim()),
      }
      return Ok(());
    }

    if let Some(rest) = line.strip_prefix("load ") {
      let mut parts = rest.split_whitespace();
      let (Some(name), Some(entries)) = (parts.next(), parts.next()) else {
        bail!("expected 'load <name> <entries>'");
      };
      let entries: i64 = entries.parse()?;
      ctx.workspace.insert_dataset(Dataset::new(name, entries));
      self.loaded.push(name.to_string());
      println!("loaded dataset {name} with {entries} entries");
      return Ok(());
    }

    if let Some(name) = line.strip_prefix("draw ") {
      return self.draw(name.trim(), ctx);
    }

    if let Some(name) = line.strip_prefix("fetch ") {
      let name = name.trim();
      match ctx.link.fetch_object(name)? {
        Some(obj) => {
          println!("fetched {}", obj.name());
          ctx.workspace.insert_value(obj);
        }
        None => println!("no such object {name}"),
      }
      return Ok(());
    }

    if let Some(rest) = line.strip_prefix("open(") {
      let args: Vec<&str> = rest
        .trim_end_matches([')', ';'])
        .split(',')
        .map(|a| a.trim().trim_matches('"'))
        .collect();
      let (file, options) = match args.as_slice() {
        [file] => (*file, ""),
        [file, options, ..] => (*file, *options),
        [] => bail!("expected 'open(\"<file>\", \"<options>\")'"),
      };
      ctx.workspace.insert_value(WireObject::Note(Note {
        name: file.to_string(),
        text: options.to_string(),
      }));
      println!("opened {file}");
      return Ok(());
    }

    bail!("syntax error near '{line}'");
  }

  fn process_file(&mut self, path: &Path, ctx: &mut EvalContext<'_>) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    for line in text.lines() {
      self.process_line(line, ctx)?;
    }
    Ok(())
  }

  fn snapshot(&self) -> Snapshot {
    Snapshot {
      globals: self.globals.clone(),
      loaded: self.loaded.clone(),
    }
  }

  fn restore(&mut self, snap: &Snapshot) {
    self.globals = snap.globals.clone();
    self.loaded = snap.loaded.clone();
  }
}

/// Credential probe consulted before a master opens a remote-class file.
/// Validates a host/user/secret triple against stored credentials.
pub trait AuthProbe {
  fn check(&self, host: &str, user: &str, secret: &str) -> bool;
}

/// Probe backed by a netrc-style credential file.
pub struct NetrcProbe {
  path: std::path::PathBuf,
}

impl NetrcProbe {
  pub fn from_home() -> Self {
    let home = std::env::var_os("HOME").unwrap_or_default();
    Self {
      path: Path::new(&home).join(".netrc"),
    }
  }

  pub fn with_path(path: &Path) -> Self {
    Self {
      path: path.to_path_buf(),
    }
  }
}

impl AuthProbe for NetrcProbe {
  fn check(&self, host: &str, user: &str, secret: &str) -> bool {
    let Ok(text) = std::fs::read_to_string(&self.path) else {
      return false;
    };
    // "machine <host> login <user> password <secret>" records, one per line.
    for line in text.lines() {
      let fields: Vec<&str> = line.split_whitespace().collect();
      if let ["machine", m, "login", l, "password", p] = fields.as_slice() {
        if *m == host && (*l == user || user.is_empty()) && (secret.is_empty() || *p == secret) {
          return true;
        }
      }
    }
    false
  }
}
