use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, unistd::isatty};

/// Exit status used when the sandbox itself failed, as opposed to the target
pub const SANDBOX_FAILURE: u8 = 125;

pub enum ZenBoxError {
  Configuration(String),
  Fork(String),
  LimitApplication { limit: &'static str, errno: Errno },
  Jail(String),
  FilterInstall(String),
  Exec(String),
  Wait(Errno),
  Nix(Errno),
  Fs(String),
  Cli(String),
  Logger(FlexiLoggerError),
  Json(serde_json::Error),
}

pub enum ZenBoxExit {
  Code(u8),
  Err(ZenBoxError),
}

impl ZenBoxError {
  pub fn configuration<MS: Into<String>>(msg: MS) -> ZenBoxError {
    ZenBoxError::Configuration(msg.into())
  }

  pub fn fork<MS: Into<String>>(msg: MS) -> ZenBoxError {
    ZenBoxError::Fork(msg.into())
  }

  pub fn jail<MS: Into<String>>(msg: MS) -> ZenBoxError {
    ZenBoxError::Jail(msg.into())
  }

  pub fn filter<MS: Into<String>>(msg: MS) -> ZenBoxError {
    ZenBoxError::FilterInstall(msg.into())
  }

  pub fn exec<MS: Into<String>>(msg: MS) -> ZenBoxError {
    ZenBoxError::Exec(msg.into())
  }

  pub fn cli<MS: Into<String>>(msg: MS) -> ZenBoxError {
    ZenBoxError::Cli(msg.into())
  }
}

impl Debug for ZenBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for ZenBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      ZenBoxError::Configuration(msg) => f.write_fmt(format_args!("ZenBox Configuration Error: {}", msg)),
      ZenBoxError::Fork(msg) => f.write_fmt(format_args!("ZenBox Fork Error: {}", msg)),
      ZenBoxError::LimitApplication { limit, errno } => {
        f.write_fmt(format_args!("ZenBox Limit Error: setting {} limit fails ({})", limit, errno))
      }
      ZenBoxError::Jail(msg) => f.write_fmt(format_args!("ZenBox Jail Error: {}", msg)),
      ZenBoxError::FilterInstall(msg) => f.write_fmt(format_args!("ZenBox Filter Error: {}", msg)),
      ZenBoxError::Exec(msg) => f.write_fmt(format_args!("ZenBox Exec Error: {}", msg)),
      ZenBoxError::Wait(errno) => f.write_fmt(format_args!("ZenBox Wait Error: {}", errno)),
      ZenBoxError::Nix(errno) => f.write_fmt(format_args!("ZenBox Nix Error: {}", errno)),
      ZenBoxError::Fs(msg) => f.write_fmt(format_args!("ZenBox File System Error: {}", msg)),
      ZenBoxError::Cli(msg) => f.write_fmt(format_args!("ZenBox CLI Error: {}", msg)),
      ZenBoxError::Logger(err) => f.write_fmt(format_args!("ZenBox Logger Error: {}", err)),
      ZenBoxError::Json(err) => f.write_fmt(format_args!("ZenBox JSON Error: {}", err)),
    }
  }
}

impl From<Errno> for ZenBoxError {
  fn from(errno: Errno) -> Self {
    ZenBoxError::Nix(errno)
  }
}

impl From<std::io::Error> for ZenBoxError {
  fn from(err: std::io::Error) -> Self {
    ZenBoxError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for ZenBoxError {
  fn from(err: FlexiLoggerError) -> Self {
    ZenBoxError::Logger(err)
  }
}

impl From<serde_json::Error> for ZenBoxError {
  fn from(err: serde_json::Error) -> Self {
    ZenBoxError::Json(err)
  }
}

impl Error for ZenBoxError {}

impl Termination for ZenBoxExit {
  fn report(self) -> ExitCode {
    match self {
      ZenBoxExit::Code(code) => ExitCode::from(code),
      ZenBoxExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              serde_json::json!({ "ok": false, "type": prefix, "message": message }).to_string()
            }
          }
          None => text,
        };
        eprintln!("{}", text);
        ExitCode::from(SANDBOX_FAILURE)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_prefix_error_kind() {
    let err = ZenBoxError::LimitApplication { limit: "cpu", errno: Errno::EPERM };
    let text = err.to_string();
    assert!(text.starts_with("ZenBox Limit Error: "));
    assert!(text.contains("cpu"));

    assert!(text.split_once(": ").is_some());

    let err = ZenBoxError::Wait(Errno::ECHILD);
    assert!(err.to_string().starts_with("ZenBox Wait Error"));
  }
}
