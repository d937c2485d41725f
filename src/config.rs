use crate::collectors::powercap::POWERCAP_ROOT_DIR;
use log::warn;
use std::path::PathBuf;
use std::time::Duration;

pub const DATA_DIR_NAME: &str = "record-job-energy-data";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;

/// Options recognized on the command line. Anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Directory,
    Timeout,
    Interval,
    PowercapRoot,
    Help,
}

impl Flag {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "d" | "directory" => Some(Flag::Directory),
            "t" | "timeout" => Some(Flag::Timeout),
            "i" | "interval" => Some(Flag::Interval),
            "powercap-root" => Some(Flag::PowercapRoot),
            "help" => Some(Flag::Help),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Output root; records land in `<directory>/<job>/<step>/`
    pub directory: PathBuf,
    /// How long rank 0 waits for its peers after finishing its own task
    pub timeout: Duration,
    /// Sleep between two checks of the step directory
    pub poll_interval: Duration,
    pub powercap_root: PathBuf,
    pub help: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            powercap_root: PathBuf::from(POWERCAP_ROOT_DIR),
            help: false,
        }
    }
}

impl Options {
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_powercap_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.powercap_root = root.into();
        self
    }
}

/// Data directory beside the executable, or the working directory if the
/// executable's location is unknown.
fn default_directory() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DATA_DIR_NAME)))
        .unwrap_or_else(|| PathBuf::from(DATA_DIR_NAME))
}

/// Parsed command line: our options, then the task to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub options: Options,
    pub task: Vec<String>,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        self.task.join(" ")
    }
}

/// The first argument not starting with a hyphen begins the task. Options may
/// use one or two leading hyphens and take values as `--name=value`; for each
/// option the first occurrence carrying a value wins.
pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Invocation {
    let split = args
        .iter()
        .position(|arg| !arg.as_ref().starts_with('-'))
        .unwrap_or(args.len());
    let (opts, task) = args.split_at(split);

    let mut options = Options::default();
    let mut seen: Vec<Flag> = Vec::new();
    for arg in opts {
        let raw: &str = arg.as_ref();
        let body = raw.strip_prefix("--").or_else(|| raw.strip_prefix('-')).unwrap_or(raw);
        let (name, value) = match body.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (body, None),
        };
        let Some(flag) = Flag::from_name(name) else {
            if !raw.is_empty() && raw != "--" {
                warn!("Ignoring unrecognized option '{}'", raw);
            }
            continue;
        };
        if flag == Flag::Help {
            options.help = true;
            continue;
        }
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            continue;
        };
        if seen.contains(&flag) {
            continue;
        }
        if apply(&mut options, flag, value) {
            seen.push(flag);
        } else {
            warn!("Ignoring malformed value in option '{}'", raw);
        }
    }

    Invocation {
        options,
        task: task.iter().map(|arg| arg.as_ref().to_string()).collect(),
    }
}

fn apply(options: &mut Options, flag: Flag, value: &str) -> bool {
    match flag {
        Flag::Directory => options.directory = PathBuf::from(value),
        Flag::PowercapRoot => options.powercap_root = PathBuf::from(value),
        Flag::Timeout => match value.parse::<u64>() {
            Ok(secs) => options.timeout = Duration::from_secs(secs),
            Err(_) => return false,
        },
        Flag::Interval => match value.parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs > 0.0 => {
                options.poll_interval = Duration::from_secs_f64(secs)
            }
            _ => return false,
        },
        Flag::Help => {}
    }
    true
}

pub fn help_text() -> String {
    format!(
        "RECORD-JOB-ENERGY HELP
  This program should be executed as:
      PARALLEL_CMD [PARALLEL_CMD_OPTS] record-job-energy [OPTS] PARALLEL_TASK [PARALLEL_TASK_OPTS]
    Where PARALLEL_CMD is srun, or mpiexec inside a Slurm allocation.
  Options for this program include:
    [-d,--directory]=DIR
      Sets the desired output directory to DIR. Default is:
        {directory}
    [-t,--timeout]=TIMEOUT
      Sets the maximum time the root process will wait for the other processes to complete
      execution, after the root process has finished its execution. Value is in seconds,
      default value is {timeout}.
    [-i,--interval]=INTERVAL
      Sets how often, in seconds, the root process checks whether the other processes have
      completed. Default value is {interval}.
    --powercap-root=DIR
      Sets the directory energy zones are discovered under. Default is:
        {powercap}
    --help
      Display this message and exit
",
        directory = default_directory().display(),
        timeout = DEFAULT_TIMEOUT_SECS,
        interval = DEFAULT_POLL_INTERVAL_SECS,
        powercap = POWERCAP_ROOT_DIR,
    )
}
