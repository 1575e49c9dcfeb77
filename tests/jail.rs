use std::fs::File;

use nix::unistd::Uid;
use tempfile::tempdir;

use zenbox::{run, SetupStage, ZenBoxBuilder, ZenBoxError, SANDBOX_FAILURE};

mod common;

#[test]
fn it_should_reject_bad_jail_before_fork() {
  common::setup();

  let dir = tempdir().unwrap();
  let missing = ZenBoxBuilder::new("/bin/true", Vec::<String>::new())
    .jail(dir.path().join("missing"))
    .build();
  assert!(matches!(missing, Err(ZenBoxError::Jail(_))));

  let file = dir.path().join("plain");
  File::create(&file).unwrap();
  let plain = ZenBoxBuilder::new("/bin/true", Vec::<String>::new())
    .jail(&file)
    .build();
  assert!(matches!(plain, Err(ZenBoxError::Jail(_))));
}

#[test]
fn it_should_never_run_target_outside_jail() {
  common::setup();

  // An empty jail has no /bin/true, so the target can never start
  let dir = tempdir().unwrap();
  let option = ZenBoxBuilder::new("/bin/true", Vec::<String>::new())
    .jail(dir.path())
    .build()
    .unwrap();
  let result = run(option).unwrap();

  let failure = result.setup_failure().clone().expect("target should not start");
  if Uid::effective().is_root() {
    assert!(result.jail_applied());
    assert_eq!(failure.stage, SetupStage::Exec);
  } else {
    assert!(!result.jail_applied());
    assert_eq!(failure.stage, SetupStage::Jail);
  }
  assert_eq!(result.exit_status(), SANDBOX_FAILURE);
}
