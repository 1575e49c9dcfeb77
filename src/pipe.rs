use std::fmt::Display;
use std::os::unix::prelude::RawFd;

use log::warn;
use nix::{
  errno::Errno,
  fcntl::OFlag,
  unistd::{self, close, pipe2},
};
use serde::{Deserialize, Serialize};

use crate::error::ZenBoxError;
use crate::limits::{LimitKind, LimitWarning};
use crate::syscall::FilterStatus;

/// Child to parent report channel, closed by a successful exec
pub struct ZenBoxPipe(RawFd, RawFd);

pub struct ZenBoxReadPipe(RawFd);

pub struct ZenBoxWritePipe(RawFd);

/// Where the child gave up before running the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStage {
  Redirect,
  Limits,
  Jail,
  Exec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSetupFailure {
  pub stage: SetupStage,
  pub errno: Errno,
  pub detail: String,
}

/// One line on the report channel, a JSON object tagged by `record`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub(crate) enum ChildRecord {
  LimitWarning { limit: LimitKind, errno: i32 },
  JailEntered,
  Filter { status: FilterStatus },
  SetupFailed { stage: SetupStage, errno: i32, detail: String },
}

/// Everything the child sent before exec or exit
#[derive(Debug, Default)]
pub(crate) struct ChildReport {
  pub limit_warnings: Vec<LimitWarning>,
  pub jail_entered: bool,
  pub filter: Option<FilterStatus>,
  pub setup_failure: Option<ChildSetupFailure>,
}

impl SetupStage {
  pub fn name(&self) -> &'static str {
    match self {
      SetupStage::Redirect => "redirect",
      SetupStage::Limits => "limits",
      SetupStage::Jail => "jail",
      SetupStage::Exec => "exec",
    }
  }
}

impl Display for ChildSetupFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_fmt(format_args!(
      "{} setup fails on {} ({})",
      self.stage.name(),
      self.detail,
      self.errno.desc()
    ))
  }
}

impl From<&ChildSetupFailure> for ZenBoxError {
  fn from(failure: &ChildSetupFailure) -> Self {
    match failure.stage {
      SetupStage::Redirect => ZenBoxError::Fs(failure.to_string()),
      SetupStage::Limits => ZenBoxError::LimitApplication {
        limit: LimitKind::from_name(&failure.detail).map_or("unknown", |kind| kind.name()),
        errno: failure.errno,
      },
      SetupStage::Jail => ZenBoxError::jail(failure.to_string()),
      SetupStage::Exec => ZenBoxError::exec(format!("{}: {}", failure.detail, failure.errno.desc())),
    }
  }
}

impl ChildRecord {
  pub(crate) fn limit_warning(warning: &LimitWarning) -> Self {
    ChildRecord::LimitWarning {
      limit: warning.kind,
      errno: warning.errno as i32,
    }
  }

  pub(crate) fn setup_failed(failure: &ChildSetupFailure) -> Self {
    ChildRecord::SetupFailed {
      stage: failure.stage,
      errno: failure.errno as i32,
      detail: failure.detail.clone(),
    }
  }

  fn encode(&self) -> Result<String, ZenBoxError> {
    // serde_json escapes newlines, one record stays on one line
    Ok(format!("{}\n", serde_json::to_string(self)?))
  }
}

impl ChildReport {
  pub(crate) fn parse(text: &str) -> Self {
    let mut report = ChildReport::default();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
      match serde_json::from_str::<ChildRecord>(line) {
        Ok(record) => report.absorb(record),
        Err(err) => warn!("Ignore malformed child record {:?}: {}", line, err),
      }
    }
    report
  }

  fn absorb(&mut self, record: ChildRecord) {
    match record {
      ChildRecord::LimitWarning { limit, errno } => self.limit_warnings.push(LimitWarning {
        kind: limit,
        errno: Errno::from_i32(errno),
      }),
      ChildRecord::JailEntered => self.jail_entered = true,
      ChildRecord::Filter { status } => self.filter = Some(status),
      ChildRecord::SetupFailed { stage, errno, detail } => {
        self.setup_failure = Some(ChildSetupFailure {
          stage,
          errno: Errno::from_i32(errno),
          detail,
        })
      }
    }
  }
}

impl ZenBoxPipe {
  pub fn new() -> Result<Self, ZenBoxError> {
    let result = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    Ok(ZenBoxPipe(result.0, result.1))
  }

  pub fn read(self) -> Result<ZenBoxReadPipe, ZenBoxError> {
    close(self.1)?;
    Ok(ZenBoxReadPipe(self.0))
  }

  pub fn write(self) -> Result<ZenBoxWritePipe, ZenBoxError> {
    close(self.0)?;
    Ok(ZenBoxWritePipe(self.1))
  }
}

impl ZenBoxReadPipe {
  /// Drain the channel, only meaningful once the child is reaped
  pub(crate) fn collect(&self) -> Result<ChildReport, ZenBoxError> {
    let mut bytes = vec![];
    let mut buf = [0u8; 512];
    loop {
      match unistd::read(self.0, &mut buf) {
        Ok(0) => break,
        Ok(size) => bytes.extend_from_slice(&buf[..size]),
        Err(Errno::EINTR) => continue,
        Err(Errno::EAGAIN) => break,
        Err(errno) => return Err(errno.into()),
      }
    }
    // 忽略 UTF-8 parse 错误
    let text = String::from_utf8_lossy(&bytes);
    Ok(ChildReport::parse(&text))
  }
}

impl Drop for ZenBoxReadPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

impl ZenBoxWritePipe {
  pub(crate) fn send(&self, record: ChildRecord) {
    // Nobody to tell if this fails
    if let Ok(line) = record.encode() {
      let _ = unistd::write(self.0, line.as_bytes());
    }
  }
}

impl Drop for ZenBoxWritePipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}
