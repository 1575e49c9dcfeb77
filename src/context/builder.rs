use std::path::PathBuf;
use std::time::Duration;

use log::debug;

use crate::jail::resolve_jail;
use crate::limits::{LimitPolicy, ResourceLimits};
use crate::utils::{into_c_string, parse_env};
use crate::{ZenBoxError, ZenBoxOption};

/// Build ZenBox running option
pub struct ZenBoxBuilder {
  program: String,
  arguments: Vec<String>,
  limits: ResourceLimits,
  policy: LimitPolicy,
  jail: Option<PathBuf>,
  network_restricted: bool,
  timeout_seconds: u64,
  poll_interval: Duration,
  env: Vec<(String, String)>,
  stdin: Option<PathBuf>,
  stdout: Option<PathBuf>,
  stderr: Option<PathBuf>,
}

impl ZenBoxBuilder {
  /// Create a new command to be run
  pub fn new<PS: Into<String>, AS: Into<String>>(program: PS, arguments: Vec<AS>) -> Self {
    ZenBoxBuilder {
      program: program.into(),
      arguments: arguments.into_iter().map(|a| a.into()).collect(),
      limits: ResourceLimits::default(),
      policy: LimitPolicy::default(),
      jail: None,
      network_restricted: false,
      timeout_seconds: 0,
      poll_interval: Duration::from_secs(1),
      env: vec![],
      stdin: None,
      stdout: None,
      stderr: None,
    }
  }

  /// Set CPU time limit (unit: s)
  pub fn cpu_seconds(mut self, value: u64) -> Self {
    self.limits.cpu_seconds = value;
    self
  }

  /// Set address space limit (unit: MB)
  pub fn memory_mb(mut self, value: u64) -> Self {
    self.limits.memory_mb = value;
    self
  }

  /// Set the max number of processes
  pub fn max_processes(mut self, value: u64) -> Self {
    self.limits.max_processes = value;
    self
  }

  /// Set file size limit (unit: MB)
  pub fn max_file_mb(mut self, value: u64) -> Self {
    self.limits.max_file_mb = value;
    self
  }

  /// Set all the limits at once
  pub fn limits(mut self, limits: ResourceLimits) -> Self {
    self.limits = limits;
    self
  }

  pub fn limit_policy(mut self, policy: LimitPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// Set jail directory or not
  pub fn set_jail<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
    self.jail = path.map(|p| p.into());
    self
  }

  /// Set jail directory
  pub fn jail<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.jail = Some(path.into());
    self
  }

  pub fn network_restricted(mut self, flag: bool) -> Self {
    self.network_restricted = flag;
    self
  }

  /// Set wall clock deadline (unit: s), `0` waits forever
  pub fn timeout_seconds(mut self, value: u64) -> Self {
    self.timeout_seconds = value;
    self
  }

  /// Set how often the deadline is checked
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// Pass env
  pub fn env<KS: Into<String>, VS: Into<String>>(mut self, key: KS, value: VS) -> Self {
    self.env.push((key.into(), value.into()));
    self
  }

  /// Parse env list
  pub fn parse_env_list(mut self, list: Vec<String>) -> Result<Self, ZenBoxError> {
    for env_var in list {
      self.env.push(parse_env(env_var)?);
    }
    Ok(self)
  }

  /// Set stdin redirection or not
  pub fn set_stdin<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
    self.stdin = path.map(|p| p.into());
    self
  }

  /// Set stdin redirection
  pub fn stdin<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.stdin = Some(path.into());
    self
  }

  /// Set stdout redirection or not
  pub fn set_stdout<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
    self.stdout = path.map(|p| p.into());
    self
  }

  /// Set stdout redirection
  pub fn stdout<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.stdout = Some(path.into());
    self
  }

  /// Set stderr redirection or not
  pub fn set_stderr<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
    self.stderr = path.map(|p| p.into());
    self
  }

  /// Set stderr redirection
  pub fn stderr<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.stderr = Some(path.into());
    self
  }

  /// Validate everything that can be checked before fork
  pub fn build(self) -> Result<ZenBoxOption, ZenBoxError> {
    if self.program.is_empty() {
      return Err(ZenBoxError::configuration("no command specified"));
    }
    into_c_string(&self.program)?;
    for argument in self.arguments.iter() {
      into_c_string(argument)?;
    }
    for (key, value) in self.env.iter() {
      if key.is_empty() || key.contains('=') {
        return Err(ZenBoxError::configuration(format!("bad environment variable name {:?}", key)));
      }
      into_c_string(value)?;
    }
    if self.poll_interval.is_zero() {
      return Err(ZenBoxError::configuration("poll interval should be positive"));
    }

    // Catch out of range limits here instead of inside the child
    self.limits.settings()?;

    let jail = match self.jail {
      Some(path) => Some(resolve_jail(path)?),
      None => None,
    };
    if let Some(jail) = &jail {
      debug!("Jail resolved to {}", jail.to_string_lossy());
    }

    Ok(ZenBoxOption {
      program: self.program,
      arguments: self.arguments,
      limits: self.limits,
      policy: self.policy,
      jail,
      network_restricted: self.network_restricted,
      timeout: match self.timeout_seconds {
        0 => None,
        seconds => Some(Duration::from_secs(seconds)),
      },
      poll_interval: self.poll_interval,
      env: self.env,
      stdin: self.stdin,
      stdout: self.stdout,
      stderr: self.stderr,
    })
  }
}
