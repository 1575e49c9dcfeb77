use std::env;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::time::Duration;

use log::info;
use tempfile::tempdir;

use zenbox::{run, FilterStatus, SetupStage, Termination, ZenBoxBuilder, SANDBOX_FAILURE};

mod common;

#[test]
fn it_should_run_true_unconstrained() {
  common::setup();

  let option = ZenBoxBuilder::new("/bin/true", Vec::<String>::new()).build().unwrap();
  let result = run(option).unwrap();

  assert_eq!(result.exit_code(), Some(0));
  assert!(!result.terminated_by_signal());
  assert!(!result.cpu_exceeded());
  assert!(!result.memory_exceeded());
  assert!(!result.file_size_exceeded());
  assert!(!result.timeout_exceeded());
  assert!(!result.jail_applied());
  assert_eq!(result.filter_status(), &FilterStatus::NotRequested);
  assert!(result.setup_failure().is_none());
  assert!(result.execution_time_seconds() >= 0.0);
  assert!(result.pid().as_raw() > 0);
  assert_eq!(result.exit_status(), 0);
}

#[test]
fn it_should_pass_exit_code_through() {
  common::setup();

  let option = ZenBoxBuilder::new("sh", vec!["-c", "exit 3"]).build().unwrap();
  let result = run(option).unwrap();

  assert_eq!(result.termination(), &Termination::Exited { code: 3 });
  assert_eq!(result.exit_status(), 3);
  assert!(result.setup_failure().is_none());
}

#[test]
fn it_should_report_missing_program_as_setup_failure() {
  common::setup();

  let option = ZenBoxBuilder::new("/definitely/not/a/program", Vec::<String>::new())
    .build()
    .unwrap();
  let result = run(option).unwrap();

  let failure = result.setup_failure().clone().expect("exec should fail in the child");
  assert_eq!(failure.stage, SetupStage::Exec);
  assert_eq!(result.exit_code(), Some(zenbox::CHILD_SETUP_FAILURE));
  assert_eq!(result.exit_status(), SANDBOX_FAILURE);
  info!("Setup failure: {}", failure);
}

#[test]
fn it_should_redirect_stdout_and_pass_env() {
  common::setup();

  let dir = tempdir().unwrap();
  let out = dir.path().join("out.txt");
  let option = ZenBoxBuilder::new("sh", vec!["-c", "echo \"hello $ZENBOX_GREETING\""])
    .env("ZENBOX_GREETING", "world")
    .stdout(&out)
    .build()
    .unwrap();
  let result = run(option).unwrap();

  assert_eq!(result.exit_code(), Some(0));
  assert_eq!(fs::read_to_string(&out).unwrap(), "hello world\n");
}

#[test]
fn it_should_kill_on_timeout() {
  common::setup();

  let option = ZenBoxBuilder::new("sleep", vec!["10"])
    .timeout_seconds(2)
    .build()
    .unwrap();
  let result = run(option).unwrap();

  assert!(result.timeout_exceeded());
  assert!(result.terminated_by_signal());
  assert_eq!(result.signal_name().as_deref(), Some("SIGKILL"));
  assert_eq!(
    result.sigkill_attribution(),
    Some(zenbox::KillAttribution::SupervisorTimeout)
  );
  assert!(!result.memory_exceeded());
  let elapsed = result.execution_time_seconds();
  info!("Timeout run took {:.3} s", elapsed);
  assert!(elapsed >= 2.0);
  assert!(elapsed < 3.0);
}

#[test]
fn it_should_return_early_within_deadline() {
  common::setup();

  let option = ZenBoxBuilder::new("sh", vec!["-c", "exit 0"])
    .timeout_seconds(5)
    .poll_interval(Duration::from_millis(50))
    .build()
    .unwrap();
  let result = run(option).unwrap();

  assert!(!result.timeout_exceeded());
  assert_eq!(result.exit_code(), Some(0));
  assert!(result.execution_time() < Duration::from_secs(5));
}

#[test]
fn it_should_grow_execution_time_with_duration() {
  common::setup();

  let quick = run(ZenBoxBuilder::new("/bin/true", Vec::<String>::new()).build().unwrap()).unwrap();
  let slow = run(ZenBoxBuilder::new("sleep", vec!["0.3"]).build().unwrap()).unwrap();

  assert!(quick.execution_time_seconds() >= 0.0);
  assert!(slow.execution_time_seconds() >= 0.3);
  assert!(slow.execution_time() > quick.execution_time());
}

#[test]
fn it_should_classify_realtime_signal_as_signaled() {
  common::setup();

  let option = ZenBoxBuilder::new("sh", vec!["-c", "kill -s 34 $$; sleep 5"])
    .timeout_seconds(10)
    .build()
    .unwrap();
  let result = run(option).unwrap();

  assert!(result.terminated_by_signal());
  assert!(!result.is_unexpected());
  assert_eq!(result.signal_number(), Some(34));
  assert_eq!(result.signal_name().as_deref(), Some("SIGRT2"));
  assert_eq!(result.exit_status(), 128 + 34);
  assert!(!result.timeout_exceeded());
}

#[test]
fn it_should_inherit_non_utf8_env() {
  common::setup();

  env::set_var("ZENBOX_RAW_BYTES", OsStr::from_bytes(b"\xff\xfe"));
  let dir = tempdir().unwrap();
  let out = dir.path().join("out.txt");
  let option = ZenBoxBuilder::new("sh", vec!["-c", "printf %s \"$ZENBOX_RAW_BYTES\""])
    .stdout(&out)
    .build()
    .unwrap();
  let result = run(option).unwrap();
  env::remove_var("ZENBOX_RAW_BYTES");

  assert_eq!(result.exit_code(), Some(0));
  assert_eq!(fs::read(&out).unwrap(), b"\xff\xfe");
}
