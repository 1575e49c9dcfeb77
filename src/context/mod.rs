use std::path::PathBuf;
use std::time::Duration;

use nix::libc::STDOUT_FILENO;
use nix::unistd::{isatty, Pid};
use serde::Serialize;

use crate::error::SANDBOX_FAILURE;
use crate::limits::{LimitPolicy, LimitWarning, ResourceLimits};
use crate::pipe::{ChildSetupFailure, SetupStage};
use crate::syscall::FilterStatus;
use crate::verdict::{signal_name, ChildUsage, KillAttribution, Termination, Verdict, Violations};
use crate::ZenBoxError;

pub use builder::ZenBoxBuilder;

mod builder;

/// ZenBox running option, validated and immutable
#[derive(Debug, Clone)]
pub struct ZenBoxOption {
  program: String,
  arguments: Vec<String>,
  limits: ResourceLimits,
  policy: LimitPolicy,
  /// Canonical jail directory
  jail: Option<PathBuf>,
  network_restricted: bool,
  timeout: Option<Duration>,
  poll_interval: Duration,
  env: Vec<(String, String)>,
  stdin: Option<PathBuf>,
  stdout: Option<PathBuf>,
  stderr: Option<PathBuf>,
}

/// ZenBox running result, written once after the child is reaped
#[derive(Debug, Clone)]
pub struct ZenBoxResult {
  pid: Pid,
  verdict: Verdict,
  execution_time: Duration,
  usage: ChildUsage,
  limits: ResourceLimits,
  jail_applied: bool,
  filter: FilterStatus,
  limit_warnings: Vec<LimitWarning>,
  setup_failure: Option<ChildSetupFailure>,
}

#[derive(Serialize)]
struct ZenBoxReport<'a> {
  ok: bool,
  pid: i32,
  exit_code: Option<i32>,
  terminated_by_signal: bool,
  signal_number: Option<i32>,
  signal_name: Option<String>,
  core_dumped: bool,
  unexpected_status: Option<&'a str>,
  execution_time_seconds: f64,
  time_user_seconds: f64,
  time_sys_seconds: f64,
  max_rss_kb: u64,
  #[serde(flatten)]
  violations: Violations,
  sigkill_attribution: Option<KillAttribution>,
  jail_applied: bool,
  network_filter_applied: bool,
  network_filter_warning: Option<&'a str>,
  limits: &'a ResourceLimits,
  limit_warnings: Vec<String>,
  setup_error: Option<SetupErrorReport>,
}

#[derive(Serialize)]
struct SetupErrorReport {
  stage: SetupStage,
  message: String,
}

impl ZenBoxOption {
  pub fn program(&self) -> &str {
    &self.program
  }

  pub fn arguments(&self) -> &Vec<String> {
    &self.arguments
  }

  pub fn limits(&self) -> &ResourceLimits {
    &self.limits
  }

  pub fn policy(&self) -> LimitPolicy {
    self.policy
  }

  pub fn jail(&self) -> &Option<PathBuf> {
    &self.jail
  }

  pub fn network_restricted(&self) -> bool {
    self.network_restricted
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  pub fn poll_interval(&self) -> Duration {
    self.poll_interval
  }

  pub fn env(&self) -> &Vec<(String, String)> {
    &self.env
  }

  pub fn stdin(&self) -> &Option<PathBuf> {
    &self.stdin
  }

  pub fn stdout(&self) -> &Option<PathBuf> {
    &self.stdout
  }

  pub fn stderr(&self) -> &Option<PathBuf> {
    &self.stderr
  }
}

impl ZenBoxResult {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    pid: Pid,
    verdict: Verdict,
    execution_time: Duration,
    usage: ChildUsage,
    limits: ResourceLimits,
    jail_applied: bool,
    filter: FilterStatus,
    limit_warnings: Vec<LimitWarning>,
    setup_failure: Option<ChildSetupFailure>,
  ) -> Self {
    ZenBoxResult {
      pid,
      verdict,
      execution_time,
      usage,
      limits,
      jail_applied,
      filter,
      limit_warnings,
      setup_failure,
    }
  }

  pub fn pid(&self) -> Pid {
    self.pid
  }

  pub fn termination(&self) -> &Termination {
    &self.verdict.termination
  }

  pub fn exit_code(&self) -> Option<i32> {
    match self.verdict.termination {
      Termination::Exited { code } => Some(code),
      _ => None,
    }
  }

  pub fn terminated_by_signal(&self) -> bool {
    matches!(self.verdict.termination, Termination::Signaled { .. })
  }

  pub fn signal_number(&self) -> Option<i32> {
    match self.verdict.termination {
      Termination::Signaled { signal, .. } => Some(signal),
      _ => None,
    }
  }

  pub fn signal_name(&self) -> Option<String> {
    match self.verdict.termination {
      Termination::Signaled { signal, .. } => Some(signal_name(signal)),
      _ => None,
    }
  }

  pub fn core_dumped(&self) -> bool {
    matches!(
      self.verdict.termination,
      Termination::Signaled {
        core_dumped: true,
        ..
      }
    )
  }

  pub fn is_unexpected(&self) -> bool {
    matches!(self.verdict.termination, Termination::Unexpected { .. })
  }

  pub fn execution_time(&self) -> Duration {
    self.execution_time
  }

  pub fn execution_time_seconds(&self) -> f64 {
    self.execution_time.as_secs_f64()
  }

  pub fn usage(&self) -> &ChildUsage {
    &self.usage
  }

  pub fn violations(&self) -> &Violations {
    &self.verdict.violations
  }

  pub fn cpu_exceeded(&self) -> bool {
    self.verdict.violations.cpu_exceeded
  }

  pub fn memory_exceeded(&self) -> bool {
    self.verdict.violations.memory_exceeded
  }

  pub fn file_size_exceeded(&self) -> bool {
    self.verdict.violations.file_size_exceeded
  }

  pub fn timeout_exceeded(&self) -> bool {
    self.verdict.violations.timeout_exceeded
  }

  pub fn sigkill_attribution(&self) -> Option<KillAttribution> {
    self.verdict.sigkill_attribution
  }

  pub fn jail_applied(&self) -> bool {
    self.jail_applied
  }

  pub fn filter_status(&self) -> &FilterStatus {
    &self.filter
  }

  pub fn network_filter_applied(&self) -> bool {
    self.filter == FilterStatus::Installed
  }

  pub fn limit_warnings(&self) -> &Vec<LimitWarning> {
    &self.limit_warnings
  }

  /// Set when the child died before the target program started
  pub fn setup_failure(&self) -> &Option<ChildSetupFailure> {
    &self.setup_failure
  }

  /// Process exit status mirroring the child.
  ///
  /// The child's own code on a normal exit, `128 + signal` on a signal,
  /// and [`SANDBOX_FAILURE`] when the sandbox could not run the target.
  pub fn exit_status(&self) -> u8 {
    if self.setup_failure.is_some() {
      return SANDBOX_FAILURE;
    }
    match self.verdict.termination {
      Termination::Exited { code } => (code & 0xff) as u8,
      Termination::Signaled { signal, .. } => (128 + signal).clamp(0, 255) as u8,
      Termination::Unexpected { .. } => SANDBOX_FAILURE,
    }
  }

  fn to_report(&self) -> ZenBoxReport<'_> {
    ZenBoxReport {
      ok: self.setup_failure.is_none() && !self.is_unexpected(),
      pid: self.pid.as_raw(),
      exit_code: self.exit_code(),
      terminated_by_signal: self.terminated_by_signal(),
      signal_number: self.signal_number(),
      signal_name: self.signal_name(),
      core_dumped: self.core_dumped(),
      unexpected_status: match &self.verdict.termination {
        Termination::Unexpected { description } => Some(description.as_str()),
        _ => None,
      },
      execution_time_seconds: self.execution_time_seconds(),
      time_user_seconds: self.usage.time_user.as_secs_f64(),
      time_sys_seconds: self.usage.time_sys.as_secs_f64(),
      max_rss_kb: self.usage.max_rss,
      violations: self.verdict.violations,
      sigkill_attribution: self.verdict.sigkill_attribution,
      jail_applied: self.jail_applied,
      network_filter_applied: self.network_filter_applied(),
      network_filter_warning: match &self.filter {
        FilterStatus::Degraded(reason) => Some(reason.as_str()),
        _ => None,
      },
      limits: &self.limits,
      limit_warnings: self
        .limit_warnings
        .iter()
        .map(|w| format!("{} limit not applied: {}", w.kind.name(), w.errno.desc()))
        .collect(),
      setup_error: self.setup_failure.as_ref().map(|failure| SetupErrorReport {
        stage: failure.stage,
        message: failure.to_string(),
      }),
    }
  }

  /// Render JSON report
  pub fn to_json(&self) -> Result<String, ZenBoxError> {
    Ok(serde_json::to_string_pretty(&self.to_report())?)
  }

  /// Report human text on a tty, JSON otherwise
  pub fn report(&self) -> Result<(), ZenBoxError> {
    let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
    if is_tty {
      self.report_human();
      Ok(())
    } else {
      self.report_json()
    }
  }

  pub fn report_json(&self) -> Result<(), ZenBoxError> {
    println!("{}", self.to_json()?);
    Ok(())
  }

  pub fn report_human(&self) {
    let status = self.exit_code().map_or_else(
      || "\x1b[91m×\x1b[39m".to_string(),
      |v| format!("\x1b[9{}m{}\x1b[39m", if v == 0 { 2 } else { 1 }, v),
    );
    let signal = match &self.verdict.termination {
      Termination::Signaled { signal, core_dumped } => format!(
        "\x1b[91m{}\x1b[39m{}",
        signal_name(*signal),
        if *core_dumped { " (core dumped)" } else { "" }
      ),
      Termination::Unexpected { description } => format!("\x1b[93m{}\x1b[39m", description),
      Termination::Exited { .. } => "\x1b[92m✓\x1b[39m".to_string(),
    };
    let flag = |v: bool| if v { "\x1b[91myes\x1b[39m" } else { "no" };

    println!();
    println!("\x1b[1mPID\x1b[22m        {}", self.pid);
    println!("\x1b[1mStatus\x1b[22m     {}", status);
    println!("\x1b[1mSignal\x1b[22m     {}", signal);
    println!("\x1b[1mTime\x1b[22m       {:.3} s", self.execution_time_seconds());
    println!("\x1b[1mTime user\x1b[22m  {:.3} s", self.usage.time_user.as_secs_f64());
    println!("\x1b[1mTime sys\x1b[22m   {:.3} s", self.usage.time_sys.as_secs_f64());
    println!("\x1b[1mMemory\x1b[22m     {} KB", self.usage.max_rss);
    println!("\x1b[1mCPU\x1b[22m        {}", flag(self.cpu_exceeded()));
    println!("\x1b[1mMemory cap\x1b[22m {}", flag(self.memory_exceeded()));
    println!("\x1b[1mFile size\x1b[22m  {}", flag(self.file_size_exceeded()));
    println!("\x1b[1mTimeout\x1b[22m    {}", flag(self.timeout_exceeded()));
    if let Some(attribution) = self.sigkill_attribution() {
      println!("\x1b[1mSIGKILL\x1b[22m    {:?}", attribution);
    }
    println!("\x1b[1mJail\x1b[22m       {}", self.jail_applied);
    println!("\x1b[1mNetwork\x1b[22m    {}", self.network_filter_applied());
    if let Some(failure) = &self.setup_failure {
      println!("\x1b[1mSetup\x1b[22m      \x1b[91m{}\x1b[39m", failure);
    }
    println!();
  }
}
