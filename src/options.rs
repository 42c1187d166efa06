//! Runtime options and the command-line surface.
//!
//! Options are layered: compiled-in defaults, then the configuration
//! file, then command-line flags. Boolean flags *toggle* whatever the
//! configuration file established, so `-b` turns batch mode off when the
//! file turned it on.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use libc::pid_t;

use crate::procfs;

/// The resolved option record threaded through the whole program.
#[derive(Clone, Debug)]
pub struct Options {
    /// Seconds between ticks.
    pub delay: f64,
    /// %CPU below which a task counts as idle.
    pub cpu_threshold: f64,
    /// Maximum number of ticks; 0 means run forever.
    pub max_iter: u32,

    /// Display only tasks whose name (or command line) contains this.
    pub only_name: Option<String>,
    /// Display only this task.
    pub only_pid: Option<pid_t>,
    /// Highlight tasks whose name (or command line) contains this.
    pub watch_name: Option<String>,
    /// Highlight this task.
    pub watch_pid: Option<pid_t>,
    /// Informational uid filter shown in the banner.
    pub watch_uid: Option<u32>,

    /// Effective uid of the monitor itself; drives the discovery filter.
    pub euid: u32,
    /// Batch output file; stdout when absent.
    pub out_path: Option<PathBuf>,
    /// Where diagnostics go (`-E`).
    pub error_file: Option<PathBuf>,

    pub batch: bool,
    /// Set by the reaper when the spawned child has exited.
    pub command_done: bool,
    /// A configuration file was found and parsed.
    pub config_file: bool,
    pub debug: bool,
    /// Register the built-in screens (disabled by `--only-conf`).
    pub default_screens: bool,
    pub idle: bool,
    pub show_cmdline: bool,
    pub show_epoch: bool,
    pub show_kernel: bool,
    pub show_threads: bool,
    pub show_timestamp: bool,
    pub show_user: bool,
    pub sticky: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            delay: 2.0,
            cpu_threshold: 0.00001,
            max_iter: 0,
            only_name: None,
            only_pid: None,
            watch_name: None,
            watch_pid: None,
            watch_uid: None,
            euid: unsafe { libc::geteuid() },
            out_path: None,
            error_file: None,
            // Batch is the only rendering mode.
            batch: true,
            command_done: false,
            config_file: false,
            debug: false,
            default_screens: true,
            idle: false,
            show_cmdline: false,
            show_epoch: false,
            show_kernel: false,
            show_threads: false,
            show_timestamp: false,
            show_user: false,
            sticky: false,
        }
    }
}

/// Command-line flags. Kept close to the traditional single-letter
/// spelling of this kind of tool.
#[derive(Debug, Parser)]
#[command(name = "perftop", version, about = "Hardware performance counters, top style")]
pub struct Cli {
    /// Run in batch mode (toggle)
    #[arg(short = 'b')]
    pub batch: bool,

    /// Use the command line instead of the process name (toggle)
    #[arg(short = 'c')]
    pub cmdline: bool,

    /// Minimum %CPU for a task to be displayed
    #[arg(long = "cpu-min", value_name = "MIN")]
    pub cpu_min: Option<f64>,

    /// Delay in seconds between refreshes
    #[arg(short = 'd', value_name = "DELAY")]
    pub delay: Option<f64>,

    /// File where errors are logged
    #[arg(short = 'E', value_name = "FILE")]
    pub error_file: Option<PathBuf>,

    /// Add the epoch at the beginning of each line (toggle)
    #[arg(long)]
    pub epoch: bool,

    /// Debug logging (toggle)
    #[arg(short = 'g')]
    pub debug: bool,

    /// Show threads (toggle)
    #[arg(short = 'H')]
    pub threads: bool,

    /// Also display idle processes (toggle)
    #[arg(short = 'i')]
    pub idle: bool,

    /// Show kernel activity, only for root (toggle)
    #[arg(short = 'K', long = "kernel")]
    pub kernel: bool,

    /// Display the list of available screens and exit
    #[arg(long = "list-screens")]
    pub list_screens: bool,

    /// Maximum number of refreshes
    #[arg(short = 'n', value_name = "NUM")]
    pub max_iter: Option<u32>,

    /// Output file in batch mode
    #[arg(short = 'o', value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Disable the built-in screens, use only the configuration file
    #[arg(long = "only-conf")]
    pub only_conf: bool,

    /// Only display the task with this PID or name
    #[arg(short = 'p', long = "pid", value_name = "PID|NAME")]
    pub only: Option<String>,

    /// Screen to display, by number or name
    #[arg(short = 'S', value_name = "NUM|NAME")]
    pub screen: Option<String>,

    /// Keep the final status of dead processes (toggle)
    #[arg(long)]
    pub sticky: bool,

    /// Add a timestamp at the beginning of each line (toggle)
    #[arg(long)]
    pub timestamp: bool,

    /// Only show this user's processes
    #[arg(short = 'u', value_name = "USER")]
    pub user: Option<String>,

    /// Show user names (toggle)
    #[arg(short = 'U')]
    pub show_user: bool,

    /// Watch this process: its rows are tagged
    #[arg(short = 'w', value_name = "PID|NAME")]
    pub watch: Option<String>,

    /// Path of the configuration file
    #[arg(short = 'W', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Export the merged configuration and exit
    #[arg(long = "export-conf")]
    pub export_conf: bool,

    /// Command to spawn and monitor
    #[arg(last = true, value_name = "CMD")]
    pub command: Vec<String>,
}

impl Options {
    /// Apply command-line flags on top of whatever the configuration file
    /// set. Exits with a message on semantically invalid flags, the same
    /// way the flag parser itself does.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if cli.batch {
            self.batch = !self.batch;
        }
        if cli.cmdline {
            self.show_cmdline = !self.show_cmdline;
        }
        if let Some(min) = cli.cpu_min {
            self.cpu_threshold = min;
        }
        if let Some(delay) = cli.delay {
            self.delay = if delay < 0.1 { 1.0 } else { delay };
        }
        if let Some(path) = &cli.error_file {
            self.error_file = Some(path.clone());
        }
        if cli.epoch {
            self.show_epoch = !self.show_epoch;
        }
        if cli.debug {
            self.debug = !self.debug;
        }
        if cli.threads {
            self.show_threads = !self.show_threads;
        }
        if cli.idle {
            self.idle = !self.idle;
        }
        if cli.kernel {
            if self.euid != 0 {
                eprintln!("Kernel mode (-K --kernel) not available.");
                eprintln!("You are not root, or the binary is not setuid.");
                process::exit(1);
            }
            self.show_kernel = !self.show_kernel;
        }
        if let Some(n) = cli.max_iter {
            self.max_iter = n;
        }
        if let Some(path) = &cli.out {
            self.out_path = Some(path.clone());
        }
        if cli.only_conf {
            self.default_screens = false;
        }
        if let Some(arg) = &cli.only {
            match arg.parse::<pid_t>() {
                Ok(pid) if pid > 0 => {
                    self.only_pid = Some(pid);
                    self.only_name = None;
                }
                _ => {
                    self.only_pid = None;
                    self.only_name = Some(arg.clone());
                }
            }
        }
        if cli.sticky {
            self.sticky = !self.sticky;
        }
        if cli.timestamp {
            self.show_timestamp = !self.show_timestamp;
        }
        if let Some(user) = &cli.user {
            let uid = if user.starts_with(|c: char| c.is_ascii_digit()) {
                user.parse().ok()
            } else {
                procfs::uid_for_name(user)
            };
            match uid {
                Some(uid) => self.watch_uid = Some(uid),
                None => {
                    eprintln!("User name '{}' does not exist.", user);
                    process::exit(1);
                }
            }
        }
        if cli.show_user {
            self.show_user = !self.show_user;
        }
        if let Some(arg) = &cli.watch {
            match arg.parse::<pid_t>() {
                Ok(pid) if pid > 0 => {
                    self.watch_pid = Some(pid);
                    self.watch_name = None;
                }
                _ => {
                    self.watch_pid = None;
                    self.watch_name = Some(arg.clone());
                }
            }
        }
    }

    /// Does this record match the only-pid / only-name display filter?
    pub fn only_filter_matches(&self, tid: pid_t, name: &str, cmdline: &str) -> bool {
        if let Some(pid) = self.only_pid {
            if tid != pid {
                return false;
            }
        }
        if let Some(pat) = &self.only_name {
            let hay = if self.show_cmdline { cmdline } else { name };
            if !hay.contains(pat.as_str()) {
                return false;
            }
        }
        true
    }

    /// Is this record the watched one?
    pub fn watch_matches(&self, tid: pid_t, name: &str, cmdline: &str) -> bool {
        if self.watch_pid == Some(tid) {
            return true;
        }
        if let Some(pat) = &self.watch_name {
            let hay = if self.show_cmdline { cmdline } else { name };
            return hay.contains(pat.as_str());
        }
        false
    }
}
