use std::time::Duration;

use nix::libc::{self, c_int};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use serde::Serialize;

use crate::limits::ResourceLimits;

/// rusage CPU time may trail the kernel's own RLIMIT_CPU accounting slightly
const CPU_ACCOUNTING_SLACK: Duration = Duration::from_millis(50);

/// How the child ended, exactly one of these
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
  Exited { code: i32 },
  Signaled { signal: c_int, core_dumped: bool },
  Unexpected { description: String },
}

/// Best guess for who sent a SIGKILL.
///
/// The kernel does not say why a SIGKILL was delivered, so a memory
/// attribution is only ever a suspicion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillAttribution {
  SupervisorTimeout,
  CpuHardLimit,
  SuspectedMemoryLimit,
  External,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Violations {
  pub cpu_exceeded: bool,
  pub memory_exceeded: bool,
  pub file_size_exceeded: bool,
  pub timeout_exceeded: bool,
}

/// Resource usage of the reaped child, taken from `wait4`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildUsage {
  pub time_user: Duration,
  pub time_sys: Duration,
  /// Peak resident set size (unit: KB)
  pub max_rss: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
  pub termination: Termination,
  pub violations: Violations,
  pub sigkill_attribution: Option<KillAttribution>,
}

impl ChildUsage {
  pub(crate) fn from_rusage(usage: &libc::rusage) -> Self {
    let into_duration = |tv: &libc::timeval| {
      Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    ChildUsage {
      time_user: into_duration(&usage.ru_utime),
      time_sys: into_duration(&usage.ru_stime),
      max_rss: usage.ru_maxrss.max(0) as u64,
    }
  }

  pub fn cpu_time(&self) -> Duration {
    self.time_user + self.time_sys
  }
}

/// First realtime signal as the kernel numbers them
const KERNEL_SIGRTMIN: c_int = 32;

/// Symbolic name of a signal number, `SIGRT<n>` for realtime signals
pub fn signal_name(signal: c_int) -> String {
  match Signal::try_from(signal) {
    Ok(signal) => signal.as_str().to_string(),
    Err(_) if signal >= KERNEL_SIGRTMIN => format!("SIGRT{}", signal - KERNEL_SIGRTMIN),
    Err(_) => format!("SIG{}", signal),
  }
}

/// Whether a raw wait status means the child is gone
pub(crate) fn is_terminal(raw: c_int) -> bool {
  libc::WIFEXITED(raw) || libc::WIFSIGNALED(raw)
}

/// Interpret a raw wait status against the configured limits.
///
/// `timed_out` is set when the supervisor killed the child itself after the
/// deadline, `usage` comes from the same `wait4` call.
pub fn classify(
  pid: Pid,
  raw: c_int,
  limits: &ResourceLimits,
  timed_out: bool,
  usage: &ChildUsage,
) -> Verdict {
  let mut violations = Violations {
    timeout_exceeded: timed_out,
    ..Default::default()
  };
  let mut sigkill_attribution = None;

  let termination = if libc::WIFEXITED(raw) {
    Termination::Exited {
      code: libc::WEXITSTATUS(raw),
    }
  } else if libc::WIFSIGNALED(raw) {
    // Realtime signals have no `Signal` variant, keep the raw number
    let signal = libc::WTERMSIG(raw);
    match Signal::try_from(signal) {
      Ok(Signal::SIGXCPU) => violations.cpu_exceeded = limits.cpu_seconds > 0,
      Ok(Signal::SIGXFSZ) => violations.file_size_exceeded = limits.max_file_mb > 0,
      Ok(Signal::SIGKILL) => {
        let attribution = attribute_kill(limits, timed_out, usage);
        match attribution {
          KillAttribution::CpuHardLimit => violations.cpu_exceeded = true,
          KillAttribution::SuspectedMemoryLimit => violations.memory_exceeded = true,
          _ => {}
        }
        sigkill_attribution = Some(attribution);
      }
      _ => {}
    }
    Termination::Signaled {
      signal,
      core_dumped: libc::WCOREDUMP(raw),
    }
  } else {
    Termination::Unexpected {
      description: match WaitStatus::from_raw(pid, raw) {
        Ok(status) => format!("{:?}", status),
        Err(_) => format!("unknown wait status {:#x}", raw),
      },
    }
  };

  Verdict {
    termination,
    violations,
    sigkill_attribution,
  }
}

fn attribute_kill(limits: &ResourceLimits, timed_out: bool, usage: &ChildUsage) -> KillAttribution {
  // 超时由 supervisor 自己 kill
  if timed_out {
    return KillAttribution::SupervisorTimeout;
  }
  // soft == hard, so the kernel goes straight to SIGKILL at the CPU limit
  if limits.cpu_seconds > 0
    && usage.cpu_time() + CPU_ACCOUNTING_SLACK >= Duration::from_secs(limits.cpu_seconds)
  {
    return KillAttribution::CpuHardLimit;
  }
  if limits.memory_mb > 0 {
    return KillAttribution::SuspectedMemoryLimit;
  }
  KillAttribution::External
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pid() -> Pid {
    Pid::from_raw(4242)
  }

  fn exited(code: i32) -> c_int {
    (code & 0xff) << 8
  }

  fn signaled(signal: Signal, core: bool) -> c_int {
    signal as c_int | if core { 0x80 } else { 0 }
  }

  fn stopped(signal: Signal) -> c_int {
    ((signal as c_int) << 8) | 0x7f
  }

  #[test]
  fn it_should_pass_exit_code_through() {
    let limits = ResourceLimits {
      cpu_seconds: 1,
      memory_mb: 64,
      ..Default::default()
    };
    let verdict = classify(pid(), exited(3), &limits, false, &ChildUsage::default());
    assert_eq!(verdict.termination, Termination::Exited { code: 3 });
    assert_eq!(verdict.violations, Violations::default());
    assert_eq!(verdict.sigkill_attribution, None);
  }

  #[test]
  fn it_should_attribute_sigxcpu_only_with_cpu_limit() {
    let usage = ChildUsage::default();
    let limits = ResourceLimits {
      cpu_seconds: 1,
      ..Default::default()
    };
    let verdict = classify(pid(), signaled(Signal::SIGXCPU, true), &limits, false, &usage);
    assert_eq!(
      verdict.termination,
      Termination::Signaled {
        signal: Signal::SIGXCPU as c_int,
        core_dumped: true
      }
    );
    assert!(verdict.violations.cpu_exceeded);

    let verdict = classify(
      pid(),
      signaled(Signal::SIGXCPU, false),
      &ResourceLimits::default(),
      false,
      &usage,
    );
    assert!(!verdict.violations.cpu_exceeded);
  }

  #[test]
  fn it_should_attribute_sigxfsz_only_with_file_limit() {
    let limits = ResourceLimits {
      max_file_mb: 1,
      ..Default::default()
    };
    let usage = ChildUsage::default();
    let verdict = classify(pid(), signaled(Signal::SIGXFSZ, false), &limits, false, &usage);
    assert!(verdict.violations.file_size_exceeded);

    let limits = ResourceLimits {
      cpu_seconds: 1,
      ..Default::default()
    };
    let verdict = classify(pid(), signaled(Signal::SIGXFSZ, false), &limits, false, &usage);
    assert!(!verdict.violations.file_size_exceeded);
  }

  #[test]
  fn it_should_prefer_timeout_for_sigkill() {
    let limits = ResourceLimits {
      memory_mb: 64,
      ..Default::default()
    };
    let verdict = classify(
      pid(),
      signaled(Signal::SIGKILL, false),
      &limits,
      true,
      &ChildUsage::default(),
    );
    assert!(verdict.violations.timeout_exceeded);
    assert!(!verdict.violations.memory_exceeded);
    assert_eq!(verdict.sigkill_attribution, Some(KillAttribution::SupervisorTimeout));
  }

  #[test]
  fn it_should_suspect_memory_for_sigkill() {
    let limits = ResourceLimits {
      memory_mb: 64,
      ..Default::default()
    };
    let verdict = classify(
      pid(),
      signaled(Signal::SIGKILL, false),
      &limits,
      false,
      &ChildUsage::default(),
    );
    assert!(verdict.violations.memory_exceeded);
    assert_eq!(verdict.sigkill_attribution, Some(KillAttribution::SuspectedMemoryLimit));
  }

  #[test]
  fn it_should_leave_external_sigkill_unattributed() {
    let verdict = classify(
      pid(),
      signaled(Signal::SIGKILL, false),
      &ResourceLimits::default(),
      false,
      &ChildUsage::default(),
    );
    assert_eq!(verdict.violations, Violations::default());
    assert_eq!(verdict.sigkill_attribution, Some(KillAttribution::External));
  }

  #[test]
  fn it_should_attribute_sigkill_at_cpu_hard_limit() {
    let limits = ResourceLimits {
      cpu_seconds: 1,
      memory_mb: 64,
      ..Default::default()
    };
    let usage = ChildUsage {
      time_user: Duration::from_millis(990),
      time_sys: Duration::from_millis(10),
      max_rss: 1024,
    };
    let verdict = classify(pid(), signaled(Signal::SIGKILL, false), &limits, false, &usage);
    assert!(verdict.violations.cpu_exceeded);
    assert!(!verdict.violations.memory_exceeded);
    assert_eq!(verdict.sigkill_attribution, Some(KillAttribution::CpuHardLimit));
  }

  #[test]
  fn it_should_keep_realtime_signal_number() {
    let limits = ResourceLimits {
      memory_mb: 64,
      ..Default::default()
    };
    let verdict = classify(pid(), 34 | 0x80, &limits, false, &ChildUsage::default());
    assert_eq!(
      verdict.termination,
      Termination::Signaled {
        signal: 34,
        core_dumped: true
      }
    );
    assert_eq!(verdict.violations, Violations::default());
    assert_eq!(verdict.sigkill_attribution, None);
    assert!(is_terminal(34));
  }

  #[test]
  fn it_should_name_signals() {
    assert_eq!(signal_name(Signal::SIGKILL as c_int), "SIGKILL");
    assert_eq!(signal_name(34), "SIGRT2");
    assert_eq!(signal_name(64), "SIGRT32");
  }

  #[test]
  fn it_should_report_stopped_as_unexpected() {
    let verdict = classify(
      pid(),
      stopped(Signal::SIGSTOP),
      &ResourceLimits::default(),
      false,
      &ChildUsage::default(),
    );
    assert!(matches!(verdict.termination, Termination::Unexpected { .. }));
    assert!(!is_terminal(stopped(Signal::SIGSTOP)));
    assert!(is_terminal(exited(0)));
    assert!(is_terminal(signaled(Signal::SIGKILL, false)));
  }
}
