use nix::errno::Errno;
use nix::libc::{rlim_t, RLIM_INFINITY};
use nix::sys::resource::{setrlimit, Resource};
use serde::{Deserialize, Serialize};

use crate::ZenBoxError;

const MEGABYTE: u64 = 1024 * 1024;

/// Resource caps applied to the child, `0` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
  /// CPU time (unit: s)
  pub cpu_seconds: u64,
  /// Address space (unit: MB)
  pub memory_mb: u64,
  pub max_processes: u64,
  /// Largest file the child may write (unit: MB)
  pub max_file_mb: u64,
}

/// What the child does when a limit can not be set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LimitPolicy {
  /// Abort the child before exec
  #[default]
  Strict,
  /// Warn and keep going
  BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
  Cpu,
  Memory,
  Processes,
  FileSize,
}

/// One kernel limit, soft and hard set to the same value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitSetting {
  kind: LimitKind,
  value: rlim_t,
}

/// A limit skipped under [`LimitPolicy::BestEffort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitWarning {
  pub kind: LimitKind,
  pub errno: Errno,
}

impl LimitKind {
  pub fn resource(self) -> Resource {
    match self {
      LimitKind::Cpu => Resource::RLIMIT_CPU,
      LimitKind::Memory => Resource::RLIMIT_AS,
      LimitKind::Processes => Resource::RLIMIT_NPROC,
      LimitKind::FileSize => Resource::RLIMIT_FSIZE,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      LimitKind::Cpu => "cpu",
      LimitKind::Memory => "memory",
      LimitKind::Processes => "process",
      LimitKind::FileSize => "file size",
    }
  }

  pub(crate) fn from_name(name: &str) -> Option<Self> {
    [LimitKind::Cpu, LimitKind::Memory, LimitKind::Processes, LimitKind::FileSize]
      .into_iter()
      .find(|kind| kind.name() == name)
  }
}

impl RlimitSetting {
  pub fn kind(&self) -> LimitKind {
    self.kind
  }

  pub fn value(&self) -> rlim_t {
    self.value
  }
}

impl ResourceLimits {
  pub fn is_unlimited(&self) -> bool {
    self.cpu_seconds == 0 && self.memory_mb == 0 && self.max_processes == 0 && self.max_file_mb == 0
  }

  /// Translate the non-zero caps into kernel limit values
  pub fn settings(&self) -> Result<Vec<RlimitSetting>, ZenBoxError> {
    let mut settings = vec![];
    if self.cpu_seconds > 0 {
      settings.push(RlimitSetting::checked(LimitKind::Cpu, Some(self.cpu_seconds))?);
    }
    if self.memory_mb > 0 {
      settings.push(RlimitSetting::checked(LimitKind::Memory, self.memory_mb.checked_mul(MEGABYTE))?);
    }
    if self.max_processes > 0 {
      settings.push(RlimitSetting::checked(LimitKind::Processes, Some(self.max_processes))?);
    }
    if self.max_file_mb > 0 {
      settings.push(RlimitSetting::checked(LimitKind::FileSize, self.max_file_mb.checked_mul(MEGABYTE))?);
    }
    Ok(settings)
  }
}

impl RlimitSetting {
  fn checked(kind: LimitKind, value: Option<u64>) -> Result<Self, ZenBoxError> {
    match value {
      Some(value) if (value as rlim_t) < RLIM_INFINITY => Ok(RlimitSetting {
        kind,
        value: value as rlim_t,
      }),
      _ => Err(ZenBoxError::configuration(format!(
        "{} limit is out of range",
        kind.name()
      ))),
    }
  }
}

/// Set every limit through `set`, honoring `policy` on failure
pub fn enforce<F>(
  settings: &[RlimitSetting],
  policy: LimitPolicy,
  mut set: F,
) -> Result<Vec<LimitWarning>, ZenBoxError>
where
  F: FnMut(Resource, rlim_t, rlim_t) -> nix::Result<()>,
{
  let mut warnings = vec![];
  for setting in settings {
    if let Err(errno) = set(setting.kind.resource(), setting.value, setting.value) {
      match policy {
        LimitPolicy::Strict => {
          return Err(ZenBoxError::LimitApplication {
            limit: setting.kind.name(),
            errno,
          })
        }
        LimitPolicy::BestEffort => warnings.push(LimitWarning {
          kind: setting.kind,
          errno,
        }),
      }
    }
  }
  Ok(warnings)
}

/// 调用 setrlimit
pub(crate) fn apply(settings: &[RlimitSetting], policy: LimitPolicy) -> Result<Vec<LimitWarning>, ZenBoxError> {
  enforce(settings, policy, setrlimit)
}
