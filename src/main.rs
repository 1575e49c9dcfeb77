use std::env;
use std::path::PathBuf;

use clap::Parser;
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::{error, info};

use zenbox::{default_format, run, LimitPolicy, ZenBoxBuilder, ZenBoxError, ZenBoxExit};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a command with resource limits, an optional jail and network filter", long_about = None)]
struct Cli {
  #[arg(long = "cpu", default_value_t = 0, help = "CPU time limit in seconds (0 = unlimited)")]
  cpu: u64,

  #[arg(long = "mem", default_value_t = 0, help = "Address space limit in MB (0 = unlimited)")]
  memory: u64,

  #[arg(long = "procs", default_value_t = 0, help = "Max number of processes (0 = unlimited)")]
  processes: u64,

  #[arg(long = "fsize", default_value_t = 0, help = "Max file size in MB (0 = unlimited)")]
  file_size: u64,

  #[arg(long, default_value_t = 0, help = "Wall clock timeout in seconds (0 = unlimited)")]
  timeout: u64,

  #[arg(long, help = "Confine the command to this directory with chroot")]
  jail: Option<PathBuf>,

  #[arg(long = "no-network", default_value_t = false, help = "Deny network syscalls")]
  no_network: bool,

  #[arg(long = "best-effort", default_value_t = false, help = "Warn instead of aborting when a limit can not be set")]
  best_effort: bool,

  #[arg(long, default_value_t = false, help = "Always report in JSON")]
  json: bool,

  #[arg(long, help = "Redirect stdin from file")]
  stdin: Option<PathBuf>,

  #[arg(long, help = "Redirect stdout to file")]
  stdout: Option<PathBuf>,

  #[arg(long, help = "Redirect stderr to file")]
  stderr: Option<PathBuf>,

  #[arg(short, long, help = "Pass environment variable, KEY=VALUE or KEY")]
  env: Vec<String>,

  #[arg(help = "Program")]
  program: String,

  #[arg(help = "Arguments", trailing_var_arg = true, allow_hyphen_values = true)]
  arguments: Vec<String>,
}

impl Cli {
  fn resolve(self) -> Result<(ZenBoxBuilder, bool), ZenBoxError> {
    let policy = if self.best_effort {
      LimitPolicy::BestEffort
    } else {
      LimitPolicy::Strict
    };
    let builder = ZenBoxBuilder::new(self.program, self.arguments)
      .cpu_seconds(self.cpu)
      .memory_mb(self.memory)
      .max_processes(self.processes)
      .max_file_mb(self.file_size)
      .timeout_seconds(self.timeout)
      .limit_policy(policy)
      .set_jail(self.jail)
      .network_restricted(self.no_network)
      .set_stdin(self.stdin)
      .set_stdout(self.stdout)
      .set_stderr(self.stderr)
      .parse_env_list(self.env)?;
    Ok((builder, self.json))
  }
}

fn bootstrap() -> Result<u8, ZenBoxError> {
  let cli = Cli::parse();

  let _logger = Logger::try_with_str("zenbox=info")?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
        .basename("zenbox")
        .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
        .suppress_timestamp(),
    )
    .append()
    .duplicate_to_stderr(Duplicate::Warn)
    .format_for_files(default_format)
    .start()?;

  let (builder, json) = cli.resolve()?;
  let option = builder.build()?;

  info!("Start running zenbox");
  let result = run(option)?;
  if let Some(failure) = result.setup_failure() {
    error!("{}", ZenBoxError::from(failure));
  }
  if json {
    result.report_json()?;
  } else {
    result.report()?;
  }
  info!("Running zenbox finished");

  Ok(result.exit_status())
}

fn main() -> ZenBoxExit {
  match bootstrap() {
    Ok(code) => ZenBoxExit::Code(code),
    Err(err) => ZenBoxExit::Err(err),
  }
}
