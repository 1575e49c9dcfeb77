pub use context::{ZenBoxBuilder, ZenBoxOption, ZenBoxResult};
pub use error::{ZenBoxError, ZenBoxExit, SANDBOX_FAILURE};
pub use jail::resolve_jail;
pub use limits::{enforce, LimitKind, LimitPolicy, LimitWarning, ResourceLimits, RlimitSetting};
pub use pipe::{ChildSetupFailure, SetupStage};
pub use supervisor::{run, CHILD_SETUP_FAILURE};
pub use syscall::{install_network_filter, FilterStatus, SyscallFilter};
pub use utils::{default_format, parse_env};
pub use verdict::{classify, signal_name, ChildUsage, KillAttribution, Termination, Verdict, Violations};

mod context;
mod error;
mod jail;
mod limits;
mod pipe;
mod supervisor;
mod syscall;
mod utils;
mod verdict;
