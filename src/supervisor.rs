use std::ffi::CString;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::libc::{self, c_int, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::WaitPidFlag;
use nix::unistd::{close, dup2, execvpe, fork, ForkResult, Pid};
use seccompiler::BpfProgram;

use crate::jail::enter_jail;
use crate::limits::{self, RlimitSetting};
use crate::pipe::{ChildRecord, ChildSetupFailure, SetupStage, ZenBoxPipe, ZenBoxWritePipe};
use crate::syscall::{install_network_filter, FilterStatus, SyscallFilter};
use crate::utils::{env_c_string, into_c_string, merge_env, path_c_string};
use crate::verdict::{classify, is_terminal, ChildUsage};
use crate::{ZenBoxError, ZenBoxOption, ZenBoxResult};

/// Exit status of a child that never reached the target program
pub const CHILD_SETUP_FAILURE: c_int = 127;

/// Everything the child needs, prepared before fork so that the child
/// only performs syscalls
struct ChildPlan {
  program: CString,
  args: Vec<CString>,
  env: Vec<CString>,
  stdin: Option<CString>,
  stdout: Option<CString>,
  stderr: Option<CString>,
  settings: Vec<RlimitSetting>,
  jail: Option<PathBuf>,
  filter: Option<Result<BpfProgram, String>>,
}

/// One raw `wait4` outcome
struct Reaped {
  raw: c_int,
  usage: ChildUsage,
}

impl ChildPlan {
  fn prepare(option: &ZenBoxOption) -> Result<Self, ZenBoxError> {
    let program = into_c_string(option.program())?;
    let mut args = vec![program.clone()];
    for argument in option.arguments() {
      args.push(into_c_string(argument)?);
    }
    let env = merge_env(option.env())
      .into_iter()
      .map(|(key, value)| env_c_string(&key, &value))
      .collect::<Result<Vec<CString>, ZenBoxError>>()?;

    let redirect = |path: &Option<PathBuf>| -> Result<Option<CString>, ZenBoxError> {
      path.as_deref().map(path_c_string).transpose()
    };

    // A filter that can not be built is reported, never fatal
    let filter = if option.network_restricted() {
      Some(SyscallFilter::network().compile().map_err(|err| err.to_string()))
    } else {
      None
    };

    Ok(ChildPlan {
      program,
      args,
      env,
      stdin: redirect(option.stdin())?,
      stdout: redirect(option.stdout())?,
      stderr: redirect(option.stderr())?,
      settings: option.limits().settings()?,
      jail: option.jail().clone(),
      filter,
    })
  }
}

fn redirect_fd(path: &Option<CString>, flags: OFlag, target: c_int) -> Result<(), Errno> {
  if let Some(path) = path {
    let fd = open(path.as_c_str(), flags, Mode::from_bits_truncate(0o644))?;
    if fd != target {
      dup2(fd, target)?;
      close(fd)?;
    }
  }
  Ok(())
}

/// 重定向输入输出
fn redirect_io(plan: &ChildPlan) -> Result<(), Errno> {
  let write_flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC;
  redirect_fd(&plan.stdin, OFlag::O_RDONLY, STDIN_FILENO)?;
  redirect_fd(&plan.stdout, write_flags, STDOUT_FILENO)?;
  redirect_fd(&plan.stderr, write_flags, STDERR_FILENO)?;
  Ok(())
}

fn failure<S: Into<String>>(stage: SetupStage, errno: Errno, detail: S) -> ChildSetupFailure {
  ChildSetupFailure {
    stage,
    errno,
    detail: detail.into(),
  }
}

/// Runs in the child: limits, jail, filter, then exec.
/// Only returns when the target program could not be started.
fn start_child(plan: &ChildPlan, channel: &ZenBoxWritePipe, option: &ZenBoxOption) -> ChildSetupFailure {
  if let Err(errno) = redirect_io(plan) {
    return failure(SetupStage::Redirect, errno, "stdio");
  }

  match limits::apply(&plan.settings, option.policy()) {
    Ok(warnings) => {
      for warning in warnings.iter() {
        channel.send(ChildRecord::limit_warning(warning));
      }
    }
    Err(ZenBoxError::LimitApplication { limit, errno }) => {
      return failure(SetupStage::Limits, errno, limit);
    }
    Err(_) => return failure(SetupStage::Limits, Errno::EINVAL, "limits"),
  }

  if let Some(root) = &plan.jail {
    if let Err(errno) = enter_jail(root) {
      return failure(SetupStage::Jail, errno, root.to_string_lossy());
    }
    channel.send(ChildRecord::JailEntered);
  }

  if let Some(filter) = &plan.filter {
    let status = match filter {
      Ok(program) => match install_network_filter(program) {
        Ok(()) => FilterStatus::Installed,
        Err(err) => FilterStatus::Degraded(err.to_string()),
      },
      Err(reason) => FilterStatus::Degraded(reason.clone()),
    };
    channel.send(ChildRecord::Filter { status });
  }

  // execvpe 运行目标程序
  match execvpe(plan.program.as_c_str(), plan.args.as_slice(), plan.env.as_slice()) {
    Ok(never) => match never {},
    Err(errno) => failure(SetupStage::Exec, errno, option.program()),
  }
}

/// `waitpid` with the child's rusage, `None` while it is still running
fn wait_child(child: Pid, options: WaitPidFlag) -> Result<Option<Reaped>, ZenBoxError> {
  let mut raw: c_int = 0;
  // rusage is plain old data, all zero is valid
  let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
  loop {
    // nix 0.26 has no wait4, and RUSAGE_CHILDREN would mix in other children
    let res = unsafe { libc::wait4(child.as_raw(), &mut raw, options.bits(), &mut usage) };
    match Errno::result(res) {
      Ok(0) => return Ok(None),
      Ok(_) => {
        return Ok(Some(Reaped {
          raw,
          usage: ChildUsage::from_rusage(&usage),
        }))
      }
      Err(Errno::EINTR) => continue,
      Err(errno) => return Err(ZenBoxError::Wait(errno)),
    }
  }
}

/// Block until the child terminates
fn wait_unbounded(child: Pid) -> Result<Reaped, ZenBoxError> {
  loop {
    if let Some(reaped) = wait_child(child, WaitPidFlag::WUNTRACED)? {
      return Ok(reaped);
    }
  }
}

/// Poll every `tick` until the child terminates or `deadline` passes.
/// Past the deadline the child is killed and reaped, the flag is `true`.
fn wait_bounded(child: Pid, start: Instant, deadline: Duration, tick: Duration) -> Result<(Reaped, bool), ZenBoxError> {
  loop {
    if let Some(reaped) = wait_child(child, WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)? {
      return Ok((reaped, false));
    }
    let elapsed = start.elapsed();
    if elapsed >= deadline {
      break;
    }
    sleep(tick.min(deadline - elapsed));
  }

  info!("Child process #{}. exceeds deadline {:?}, killing", child, deadline);
  match kill(child, Signal::SIGKILL) {
    Ok(()) | Err(Errno::ESRCH) => {}
    Err(errno) => error!("Kill child process #{}. fails: {}", child, errno),
  }
  Ok((wait_unbounded(child)?, true))
}

/// Stopped or otherwise non-terminal: kill so nothing is left behind
fn reap_stray(child: Pid, reaped: Reaped) -> Result<Reaped, ZenBoxError> {
  if is_terminal(reaped.raw) {
    return Ok(reaped);
  }
  warn!("Child process #{}. reports a non-terminal status {:#x}", child, reaped.raw);
  let _ = kill(child, Signal::SIGKILL);
  loop {
    let next = wait_unbounded(child)?;
    if is_terminal(next.raw) {
      // Keep the original status so it is classified as unexpected
      return Ok(Reaped {
        raw: reaped.raw,
        usage: next.usage,
      });
    }
  }
}

fn log_plan(option: &ZenBoxOption) {
  let limits = option.limits();
  if limits.is_unlimited() {
    info!("No resource limits applied (unlimited)");
  } else {
    info!(
      "Resource limits: cpu = {} s, memory = {} MB, processes = {}, file size = {} MB ({:?})",
      limits.cpu_seconds,
      limits.memory_mb,
      limits.max_processes,
      limits.max_file_mb,
      option.policy()
    );
  }
  if let Some(jail) = option.jail() {
    info!("Jail: {}", jail.to_string_lossy());
  }
  if option.network_restricted() {
    info!("Network syscalls restricted");
  }
  if let Some(timeout) = option.timeout() {
    info!("Wall clock deadline: {:?}", timeout);
  }
  info!(
    "Start running program {} {}",
    option.program(),
    option.arguments().join(" ")
  );
}

/// Run one command inside the sandbox and classify how it ended.
///
/// Errors returned here come from the supervisor itself (configuration,
/// fork, wait). Anything that goes wrong inside the child shows up in
/// [`ZenBoxResult::setup_failure`].
pub fn run(option: ZenBoxOption) -> Result<ZenBoxResult, ZenBoxError> {
  let plan = ChildPlan::prepare(&option)?;
  log_plan(&option);

  let channel = ZenBoxPipe::new()?;
  let start = Instant::now();

  match unsafe { fork() } {
    Ok(ForkResult::Parent { child, .. }) => {
      let channel = channel.read()?;
      info!("Start running child process (pid = {})", child);

      let (reaped, timed_out) = match option.timeout() {
        Some(deadline) => wait_bounded(child, start, deadline, option.poll_interval())?,
        None => (wait_unbounded(child)?, false),
      };
      let reaped = reap_stray(child, reaped)?;
      let execution_time = start.elapsed();

      let report = channel.collect()?;
      for warning in report.limit_warnings.iter() {
        warn!("{} limit not applied: {}", warning.kind.name(), warning.errno.desc());
      }
      if let Some(FilterStatus::Degraded(reason)) = &report.filter {
        warn!("Network filter not installed: {}", reason);
      }
      if let Some(failure) = &report.setup_failure {
        error!("Child process #{}. {}", child, failure);
      }

      let verdict = classify(child, reaped.raw, option.limits(), timed_out, &reaped.usage);
      debug!("Child process #{}. {:?} in {:?}", child, verdict, execution_time);

      let filter = match report.filter {
        Some(status) => status,
        None => FilterStatus::NotRequested,
      };

      Ok(ZenBoxResult::new(
        child,
        verdict,
        execution_time,
        reaped.usage,
        *option.limits(),
        report.jail_entered,
        filter,
        report.limit_warnings,
        report.setup_failure,
      ))
    }
    Ok(ForkResult::Child) => {
      if let Ok(channel) = channel.write() {
        let failure = start_child(&plan, &channel, &option);
        channel.send(ChildRecord::setup_failed(&failure));
      }
      unsafe { libc::_exit(CHILD_SETUP_FAILURE) };
    }
    Err(errno) => Err(ZenBoxError::fork(errno.desc())),
  }
}
