use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None,
    override_usage = "\n    sexec [OPTIONS] [ARGS...]\n    sexec [OPTIONS] config [KEYS...]")]
pub struct Args {
    /**********************/
    /* Flags and settings */
    /**********************/
    /// Set the log level to one of trace, debug, info, warn, or error.
    /// `-v` is shorthand for enabling verbose (trace) logging.
    #[arg(short = 'v',
        long,
        global = true,
        default_missing_value = "trace",
        num_args = 0..=1,
        require_equals = true,
        value_parser = parse_log_level
    )]
    pub log_level: Option<log::LevelFilter>,

    /// Container image to launch. Overrides SINGULARITY_IMAGE.
    #[arg(long, global = true, value_hint = clap::ValueHint::FilePath)]
    pub image: Option<PathBuf>,

    /// What to run in the container: shell (the default), run, or exec.
    /// Overrides SINGULARITY_COMMAND.
    #[arg(long, global = true, value_hint = clap::ValueHint::Other)]
    pub command: Option<String>,

    /// Mount the image read-write. This requires an exclusive lock on the
    /// image, so no other launch may be using it.
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub writable: bool,

    /// Give the container private /tmp, /var/tmp and home directories
    /// instead of the host's.
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub contain: bool,

    /// Don't create a new PID namespace.
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub no_namespace_pid: bool,

    /// Don't unshare filesystem attributes (root, cwd, umask).
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub no_namespace_fs: bool,

    /// Don't unshare the file descriptor table.
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub no_namespace_files: bool,

    /// Formats action output as a JSON blob. Does nothing for launches.
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub json: bool,

    /***************/
    /* Subcommands */
    /***************/
    #[command(subcommand)]
    pub action: Option<Action>,

    /*************/
    /* Arguments */
    /*************/
    /// Arguments for the program run in the container. In exec mode the
    /// first argument is the command string.
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 0..,
        value_parser = validate_argument,
        help_heading = "Container Arguments",
    )]
    pub args: Option<Vec<String>>,
}

#[derive(clap::Subcommand, Clone, Debug)]
#[command(subcommand_help_heading = "Actions")]
pub enum Action {
    /// Get current configuration options
    Config {
        /// The keys to get from the configuration
        #[arg(value_name = "KEYS", num_args = 0..)]
        keys: Option<Vec<String>>,
    },
}

static ARG_COUNT: AtomicUsize = AtomicUsize::new(0);

// Because of the way clap works, if someone tries to pass a parameter that doesn't exist, we'll
// see it here as an argument. This is a bit of a hack to catch that case.
fn validate_argument(s: &str) -> Result<String, String> {
    if ARG_COUNT.fetch_add(1, Ordering::Relaxed) == 0
        && s.starts_with('-')
        && s != "--"
    {
        Err(String::from("Unknown option"))
    } else {
        Ok(s.to_string())
    }
}

fn parse_log_level(s: &str) -> Result<log::LevelFilter, String> {
    s.parse::<log::LevelFilter>().map_err(|e| e.to_string())
}
