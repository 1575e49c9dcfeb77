use std::fs::canonicalize;
use std::path::{Path, PathBuf};

use log::debug;
use nix::errno::Errno;
use nix::unistd::{access, chdir, chroot, AccessFlags};

use crate::ZenBoxError;

/// Resolve and check a jail directory before fork.
///
/// The returned path is canonical, exists, is a directory and can be
/// traversed by the current user. Resolving an already resolved path gives
/// back the same path.
pub fn resolve_jail<P: AsRef<Path>>(path: P) -> Result<PathBuf, ZenBoxError> {
  let path = path.as_ref();
  let resolved = canonicalize(path)
    .map_err(|err| ZenBoxError::jail(format!("can not resolve {}: {}", path.to_string_lossy(), err)))?;

  if !resolved.is_dir() {
    return Err(ZenBoxError::jail(format!(
      "{} is not a directory",
      resolved.to_string_lossy()
    )));
  }

  access(&resolved, AccessFlags::X_OK).map_err(|errno| {
    ZenBoxError::jail(format!(
      "{} is not traversable: {}",
      resolved.to_string_lossy(),
      errno.desc()
    ))
  })?;

  debug!("Resolve jail {} -> {}", path.to_string_lossy(), resolved.to_string_lossy());
  Ok(resolved)
}

/// chroot into a resolved jail, only called in the child
pub(crate) fn enter_jail(root: &Path) -> Result<(), Errno> {
  chdir(root)?;
  chroot(root)?;
  chdir(Path::new("/"))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::fs::File;

  use tempfile::tempdir;

  use super::*;

  #[test]
  fn it_should_resolve_idempotently() {
    let dir = tempdir().unwrap();
    let nested = dir.path().join("jail");
    std::fs::create_dir(&nested).unwrap();

    let winding = dir.path().join("jail").join("..").join("jail");
    let first = resolve_jail(&winding).unwrap();
    let second = resolve_jail(&first).unwrap();
    assert_eq!(first, second);
    assert!(first.is_absolute());
    assert!(!first.to_string_lossy().contains(".."));
  }

  #[test]
  fn it_should_reject_missing_path() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing");
    assert!(matches!(resolve_jail(&missing), Err(ZenBoxError::Jail(_))));
  }

  #[test]
  fn it_should_reject_regular_file() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("file");
    File::create(&file).unwrap();
    match resolve_jail(&file) {
      Err(ZenBoxError::Jail(msg)) => assert!(msg.contains("not a directory")),
      _ => panic!("a regular file is not a jail"),
    }
  }
}
