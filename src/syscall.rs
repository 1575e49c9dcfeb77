use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_long;

use log::debug;
use nix::errno::Errno;
use nix::libc::{
  self, SYS_accept, SYS_accept4, SYS_bind, SYS_connect, SYS_listen, SYS_recvfrom, SYS_recvmmsg,
  SYS_recvmsg, SYS_sendmmsg, SYS_sendmsg, SYS_sendto, SYS_socket, SYS_socketpair,
};
use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use serde::{Deserialize, Serialize};

use crate::ZenBoxError;

/// Syscall filter on top of an allow-all program.
/// Denied syscalls fail with `EPERM` instead of killing the process.
#[derive(Debug, Clone, Default)]
pub struct SyscallFilter {
  denied: BTreeSet<c_long>,
}

/// How the network filter ended up in the child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStatus {
  NotRequested,
  Installed,
  Degraded(String),
}

impl SyscallFilter {
  pub fn new() -> Self {
    SyscallFilter {
      denied: BTreeSet::new(),
    }
  }

  /// Deny socket creation, connection setup and message transfer
  pub fn network() -> Self {
    let mut filter = SyscallFilter::new();
    filter
      .forbid(SYS_socket)
      .forbid(SYS_socketpair)
      .forbid(SYS_connect)
      .forbid(SYS_bind)
      .forbid(SYS_listen)
      .forbid(SYS_accept)
      .forbid(SYS_accept4)
      .forbid(SYS_sendto)
      .forbid(SYS_sendmsg)
      .forbid(SYS_sendmmsg)
      .forbid(SYS_recvfrom)
      .forbid(SYS_recvmsg)
      .forbid(SYS_recvmmsg);
    filter
  }

  pub fn forbid(&mut self, id: c_long) -> &mut Self {
    self.denied.insert(id);
    self
  }

  pub fn is_forbidden(&self, id: c_long) -> bool {
    self.denied.contains(&id)
  }

  /// Emit the BPF program, nothing is installed here
  pub fn compile(&self) -> Result<BpfProgram, ZenBoxError> {
    if self.denied.is_empty() {
      return Err(ZenBoxError::filter("no syscall to deny"));
    }

    let arch = if cfg!(target_arch = "x86_64") {
      TargetArch::x86_64
    } else if cfg!(target_arch = "aarch64") {
      TargetArch::aarch64
    } else if cfg!(target_arch = "riscv64") {
      TargetArch::riscv64
    } else {
      return Err(ZenBoxError::filter("unsupported architecture for seccomp"));
    };

    // Empty rule list matches the syscall unconditionally
    let rules = self
      .denied
      .iter()
      .map(|id| (*id as i64, vec![]))
      .collect::<BTreeMap<i64, Vec<SeccompRule>>>();

    let filter = SeccompFilter::new(
      rules,
      SeccompAction::Allow,
      SeccompAction::Errno(libc::EPERM as u32),
      arch,
    )
    .map_err(|err| ZenBoxError::filter(err.to_string()))?;

    let program: Result<BpfProgram, _> = filter.try_into();
    let program = program.map_err(|err| ZenBoxError::filter(err.to_string()))?;
    debug!("Compile syscall filter with {} denied syscalls", self.denied.len());
    Ok(program)
  }
}

/// Forbid privilege escalation, then attach `program` to the calling process.
///
/// Either step failing leaves the filter reported as not installed.
pub fn install_network_filter(program: &BpfProgram) -> Result<(), ZenBoxError> {
  let (on, unused) = (1 as libc::c_ulong, 0 as libc::c_ulong);
  let res = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, on, unused, unused, unused) };
  Errno::result(res).map_err(|errno| ZenBoxError::filter(format!("no_new_privs: {}", errno.desc())))?;

  seccompiler::apply_filter(program).map_err(|err| ZenBoxError::filter(err.to_string()))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use nix::libc::{SYS_read, SYS_write};

  #[test]
  fn it_should_deny_network_syscalls() {
    let filter = SyscallFilter::network();
    assert!(filter.is_forbidden(SYS_socket));
    assert!(filter.is_forbidden(SYS_connect));
    assert!(filter.is_forbidden(SYS_sendto));
    assert!(filter.is_forbidden(SYS_recvmsg));
    assert!(!filter.is_forbidden(SYS_read));
    assert!(!filter.is_forbidden(SYS_write));
  }

  #[test]
  fn it_should_compile_network_filter() {
    let program = SyscallFilter::network().compile();
    if cfg!(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")) {
      let program = program.unwrap();
      assert!(!program.is_empty());
    } else {
      assert!(program.is_err());
    }
  }

  #[test]
  fn it_should_refuse_empty_filter() {
    assert!(matches!(SyscallFilter::new().compile(), Err(ZenBoxError::FilterInstall(_))));
  }
}
