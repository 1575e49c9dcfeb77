use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use flexi_logger::DeferredNow;
use log::{error, info, Record};

use crate::ZenBoxError;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Child process #42. exited with status 0```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string<S: AsRef<str>>(string: S) -> Result<CString, ZenBoxError> {
  let string = string.as_ref();
  CString::new(string)
    .map_err(|_| ZenBoxError::configuration(format!("{:?} contains an interior NUL byte", string)))
}

pub(crate) fn path_c_string(path: &Path) -> Result<CString, ZenBoxError> {
  CString::new(path.as_os_str().as_bytes())
    .map_err(|_| ZenBoxError::configuration(format!("{:?} contains an interior NUL byte", path)))
}

/// `KEY=VALUE` for `execvpe`, bytes taken as is
pub(crate) fn env_c_string(key: &OsStr, value: &OsStr) -> Result<CString, ZenBoxError> {
  let mut bytes = Vec::with_capacity(key.len() + value.len() + 1);
  bytes.extend_from_slice(key.as_bytes());
  bytes.push(b'=');
  bytes.extend_from_slice(value.as_bytes());
  CString::new(bytes).map_err(|_| {
    ZenBoxError::configuration(format!("environment variable {:?} contains an interior NUL byte", key))
  })
}

/// Parse `KEY=VALUE`, or `KEY` which copies the current value of `KEY`
pub fn parse_env<S: AsRef<str>>(text: S) -> Result<(String, String), ZenBoxError> {
  let text = text.as_ref();
  match text.split_once('=') {
    Some((key, _)) if key.is_empty() => {
      error!("Wrong environment variable string ({}) format", text);
      Err(ZenBoxError::cli("Wrong environment variable string format"))
    }
    Some((key, value)) => Ok((key.to_string(), value.to_string())),
    None if text.is_empty() => Err(ZenBoxError::cli("Empty environment variable string")),
    None => {
      let value = env::var(text).unwrap_or_default();
      info!("Read environment variable {} = {}", text, value);
      Ok((text.to_string(), value))
    }
  }
}

/// Current environment with `extra` pairs overriding inherited keys
pub(crate) fn merge_env(extra: &[(String, String)]) -> Vec<(OsString, OsString)> {
  // Inherited values need not be UTF-8
  let mut envs = env::vars_os()
    .filter(|(key, _)| !extra.iter().any(|(k, _)| OsStr::new(k) == key.as_os_str()))
    .collect::<Vec<(OsString, OsString)>>();
  envs.extend(extra.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))));
  envs
}
