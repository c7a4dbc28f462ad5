//! Memory sizes and resident-memory sampling for worker processes.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// How many recent RSS samples a trace keeps for trend detection.
const TREND_WINDOW: usize = 8;

/// Peak RSS at or above this share of the limit counts as "near the limit".
const NEAR_LIMIT_PERCENT: u64 = 90;

/// Memory size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
  pub const fn from_bytes(bytes: u64) -> Self {
    Self(bytes)
  }

  pub const fn from_mib(mib: u64) -> Self {
    Self(mib.saturating_mul(1024 * 1024))
  }

  pub const fn from_gib(gib: u64) -> Self {
    Self(gib.saturating_mul(1024 * 1024 * 1024))
  }

  pub const fn as_bytes(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for MemorySize {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    const MIB: u64 = 1024 * 1024;
    if self.0 >= MIB {
      write!(f, "{}M", self.0 / MIB)
    } else {
      write!(f, "{}B", self.0)
    }
  }
}

impl FromStr for MemorySize {
  type Err = String;

  /// Accepts plain bytes or a `K`/`M`/`G` suffix (binary units), e.g. `"100M"`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
      Some('K') => (&s[..s.len() - 1], 1024),
      Some('M') => (&s[..s.len() - 1], 1024 * 1024),
      Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
      _ => (s, 1),
    };
    let value: u64 = digits
      .trim()
      .parse()
      .map_err(|e| format!("invalid memory size '{s}': {e}"))?;
    value
      .checked_mul(multiplier)
      .map(Self)
      .ok_or_else(|| format!("memory size '{s}' overflows"))
  }
}

/// Resident-memory history of one worker process, as seen by the watchdog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTrace {
  recent: VecDeque<u64>,
  peak_bytes: u64,
  limit_bytes: Option<u64>,
  reaped: bool,
}

impl MemoryTrace {
  pub fn new(limit: Option<MemorySize>) -> Self {
    Self {
      limit_bytes: limit.map(|l| l.as_bytes()),
      ..Self::default()
    }
  }

  /// Adds a sample and returns `true` if it exceeds the limit.
  pub fn record(&mut self, rss_bytes: u64) -> bool {
    if self.recent.len() == TREND_WINDOW {
      self.recent.pop_front();
    }
    self.recent.push_back(rss_bytes);
    self.peak_bytes = self.peak_bytes.max(rss_bytes);
    self.limit_bytes.is_some_and(|limit| rss_bytes > limit)
  }

  /// Marks the process as killed by the watchdog for exceeding its limit.
  pub fn mark_reaped(&mut self) {
    self.reaped = true;
  }

  pub fn was_reaped(&self) -> bool {
    self.reaped
  }

  pub fn peak_bytes(&self) -> u64 {
    self.peak_bytes
  }

  pub fn limit_bytes(&self) -> Option<u64> {
    self.limit_bytes
  }

  pub fn samples(&self) -> impl Iterator<Item = u64> + '_ {
    self.recent.iter().copied()
  }

  pub fn near_limit(&self) -> bool {
    self
      .limit_bytes
      .is_some_and(|limit| limit > 0 && self.peak_bytes.saturating_mul(100) >= limit.saturating_mul(NEAR_LIMIT_PERCENT))
  }

  /// At least three samples, never shrinking, and the last one strictly
  /// above the first.
  pub fn is_rising(&self) -> bool {
    if self.recent.len() < 3 {
      return false;
    }
    let non_decreasing = self.recent.iter().zip(self.recent.iter().skip(1)).all(|(a, b)| b >= a);
    non_decreasing && self.recent.back() > self.recent.front()
  }
}

/// Assume 4 KiB pages.
const PAGE_SIZE: u64 = 4096;

/// Live members of one process group and their combined resident memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct GroupUsage {
  pub members: usize,
  pub resident_bytes: u64,
}

/// Sums the resident set size of every process in group `pgid`.
///
/// Walks `/proc/*/stat`; processes that exit mid-scan are skipped. Returns
/// `None` when `/proc` cannot be read.
#[cfg(target_os = "linux")]
pub(crate) fn group_usage(pgid: u32) -> Option<GroupUsage> {
  let mut usage = GroupUsage::default();
  for entry in std::fs::read_dir("/proc").ok()?.flatten() {
    let name = entry.file_name();
    let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
      continue;
    };
    let Ok(contents) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
      continue;
    };
    if let Some((group, rss)) = parse_stat_group_and_rss(&contents) {
      if group == pgid {
        usage.members += 1;
        usage.resident_bytes = usage.resident_bytes.saturating_add(rss);
      }
    }
  }
  Some(usage)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn group_usage(_pgid: u32) -> Option<GroupUsage> {
  None
}

/// Extracts the process group (field 5) and resident bytes (field 24) from a
/// `/proc/<pid>/stat` line. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_group_and_rss(contents: &str) -> Option<(u32, u64)> {
  let rest = &contents[contents.rfind(')')? + 1..];
  let fields: Vec<&str> = rest.split_whitespace().collect();
  let pgrp = fields.get(2)?.parse().ok()?;
  let rss_pages: u64 = fields.get(21)?.parse().ok()?;
  Some((pgrp, rss_pages.saturating_mul(PAGE_SIZE)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_sizes_with_suffixes() {
    assert_eq!("100M".parse::<MemorySize>(), Ok(MemorySize::from_mib(100)));
    assert_eq!("2g".parse::<MemorySize>(), Ok(MemorySize::from_gib(2)));
    assert_eq!("4K".parse::<MemorySize>(), Ok(MemorySize::from_bytes(4096)));
    assert_eq!("512".parse::<MemorySize>(), Ok(MemorySize::from_bytes(512)));
    assert!("lots".parse::<MemorySize>().is_err());
    assert!("".parse::<MemorySize>().is_err());
  }

  #[test]
  fn trace_flags_samples_over_limit() {
    let mut trace = MemoryTrace::new(Some(MemorySize::from_bytes(1000)));
    assert!(!trace.record(500));
    assert!(!trace.record(1000));
    assert!(trace.record(1001));
    assert_eq!(trace.peak_bytes(), 1001);
    assert!(trace.near_limit());
  }

  #[test]
  fn trace_without_limit_never_exceeds() {
    let mut trace = MemoryTrace::new(None);
    assert!(!trace.record(u64::MAX));
    assert!(!trace.near_limit());
  }

  #[test]
  fn rising_needs_three_growing_samples() {
    let mut trace = MemoryTrace::new(None);
    trace.record(10);
    trace.record(20);
    assert!(!trace.is_rising());
    trace.record(30);
    assert!(trace.is_rising());
    trace.record(5);
    assert!(!trace.is_rising());
  }

  #[test]
  fn trend_window_is_bounded() {
    let mut trace = MemoryTrace::new(None);
    for i in 0..100 {
      trace.record(i);
    }
    assert_eq!(trace.samples().count(), TREND_WINDOW);
    assert_eq!(trace.samples().next(), Some(100 - TREND_WINDOW as u64));
  }

  #[test]
  fn large_constructors_saturate() {
    assert_eq!(MemorySize::from_mib(u64::MAX).as_bytes(), u64::MAX);
    assert_eq!(MemorySize::from_gib(1 << 40).as_bytes(), u64::MAX);
    assert_eq!(MemorySize::from_gib(1).as_bytes(), 1 << 30);
  }

  #[test]
  fn parses_group_and_rss_from_stat() {
    let stat = "4242 (my (odd) cmd) S 1 4200 4200 0 -1 4194560 100 0 0 0 1 2 0 0 20 0 1 0 500 \
                10000000 300 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0\n";
    assert_eq!(parse_stat_group_and_rss(stat), Some((4200, 300 * 4096)));
    assert_eq!(parse_stat_group_and_rss("4242 (cmd) S 1"), None);
    assert_eq!(parse_stat_group_and_rss("garbage"), None);
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn own_group_has_members_and_memory() {
    let pgid = nix::unistd::getpgrp().as_raw() as u32;
    let usage = group_usage(pgid).unwrap();
    assert!(usage.members >= 1);
    assert!(usage.resident_bytes > 0);
  }
}
