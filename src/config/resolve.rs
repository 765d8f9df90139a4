use super::PartialConfig;
use super::cli::Args;
use crate::config::{CommandMode, Config};
use crate::error::Error;
use crate::loopdev::MAX_LOOP_DEVICES;
use crate::namespace::NamespaceOptions;
use anyhow::{Context, Result};
use log::trace;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::{env, str::FromStr};

/// Root owned configuration file. Only this file may move security
/// relevant paths.
pub const SYSTEM_CONFIG: &str = "/etc/singularity/sexec.toml";

/// Where an input came from, for `sexec config`.
const ENVIRONMENT: &str = "environment";
const CLI: &str = "cli";
const DEFAULT: &str = "default";

/// The environment we read. Kept behind a closure so tests can feed in
/// their own variables without touching the process environment.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub fn resolve_config(cli: Args) -> Result<Config> {
    let (partial_config, sources) = load_partial(Path::new(SYSTEM_CONFIG))?;
    let lookup = |key: &str| env::var(key).ok();
    resolve_with(cli, partial_config, sources, &lookup)
}

pub fn resolve_with(
    cli: Args,
    mut partial_config: PartialConfig,
    mut sources: HashMap<String, String>,
    env: EnvLookup,
) -> Result<Config> {
    // Override with environment variables if set
    if let Some(log_level) = env("SINGULARITY_LOG_LEVEL") {
        if let Ok(log_level) = log::LevelFilter::from_str(&log_level) {
            partial_config.log_level = Some(log_level);
            sources.insert("log_level".into(), ENVIRONMENT.into());
        } else {
            return Err(Error::InvalidConfig(format!(
                "Invalid log level: {}",
                log_level
            ))
            .into());
        }
    }

    // Override with CLI args if provided (highest precedence)
    if let Some(log_level) = cli.log_level {
        partial_config.log_level = Some(log_level);
        sources.insert("log_level".into(), CLI.into());
    }

    let image = pick(
        &mut sources,
        "image",
        cli.image,
        env("SINGULARITY_IMAGE").filter(|s| !s.is_empty()).map(PathBuf::from),
    );

    let command = pick(
        &mut sources,
        "command",
        cli.command,
        env("SINGULARITY_COMMAND"),
    );
    let command = match command {
        Some(command) => CommandMode::from_str(&command)?,
        None => CommandMode::Shell,
    };

    let mut args = cli.args.unwrap_or_default();
    let exec_command = if command == CommandMode::Exec {
        if !args.is_empty() {
            sources.insert("exec_command".into(), CLI.into());
            Some(args.remove(0))
        } else if let Some(exec) = env("SINGULARITY_EXEC") {
            sources.insert("exec_command".into(), ENVIRONMENT.into());
            Some(exec)
        } else {
            return Err(Error::MissingExecCommand.into());
        }
    } else {
        None
    };

    let writable = flag(&mut sources, "writable", cli.writable, env("SINGULARITY_WRITABLE"));
    let contain = flag(&mut sources, "contain", cli.contain, env("SINGULARITY_CONTAIN"));
    let namespaces = NamespaceOptions {
        pid: !flag(
            &mut sources,
            "no_namespace_pid",
            cli.no_namespace_pid,
            env("SINGULARITY_NO_NAMESPACE_PID"),
        ),
        fs: !flag(
            &mut sources,
            "no_namespace_fs",
            cli.no_namespace_fs,
            env("SINGULARITY_NO_NAMESPACE_FS"),
        ),
        files: !flag(
            &mut sources,
            "no_namespace_files",
            cli.no_namespace_files,
            env("SINGULARITY_NO_NAMESPACE_FILES"),
        ),
    };

    // If nothing else, fill in with some default values
    let state_dir = default(&mut sources, "state_dir", partial_config.state_dir, "/var");
    let sysconf_dir =
        default(&mut sources, "sysconf_dir", partial_config.sysconf_dir, "/etc");
    let tmp_root = default(&mut sources, "tmp_root", partial_config.tmp_root, "/tmp");
    let max_loop_devices = partial_config.max_loop_devices.unwrap_or(MAX_LOOP_DEVICES);
    sources.entry("max_loop_devices".into()).or_insert(DEFAULT.into());

    let config = Config {
        log_level: partial_config.log_level.unwrap_or(log::LevelFilter::Info),
        image,
        command,
        exec_command,
        args,
        writable,
        contain,
        namespaces,
        state_dir,
        sysconf_dir,
        tmp_root,
        max_loop_devices,
        sources,
    };

    validate_config(&config)?;

    trace!("Image: {:?}", config.image);
    trace!("Command: {}", config.command);

    Ok(config)
}

/// CLI value if given, otherwise the environment's.
fn pick<T>(
    sources: &mut HashMap<String, String>,
    key: &str,
    cli: Option<T>,
    env: Option<T>,
) -> Option<T> {
    if cli.is_some() {
        sources.insert(key.into(), CLI.into());
        return cli;
    }
    if env.is_some() {
        sources.insert(key.into(), ENVIRONMENT.into());
        return env;
    }
    sources.insert(key.into(), DEFAULT.into());
    None
}

/// Boolean inputs are switched on by the CLI flag or by the mere presence
/// of the environment variable, whatever its value.
fn flag(
    sources: &mut HashMap<String, String>,
    key: &str,
    cli: bool,
    env: Option<String>,
) -> bool {
    pick(sources, key, cli.then_some(()), env.map(drop)).is_some()
}

fn default(
    sources: &mut HashMap<String, String>,
    key: &str,
    value: Option<PathBuf>,
    fallback: &str,
) -> PathBuf {
    sources.entry(key.into()).or_insert(DEFAULT.into());
    value.unwrap_or_else(|| PathBuf::from(fallback))
}

/**
 * Load the system configuration file. It is ignored when absent, and
 * refused when anybody but root could have written it.
 */
pub fn load_partial(path: &Path) -> Result<(PartialConfig, HashMap<String, String>)> {
    let mut sources = HashMap::new();
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!("No config file found at {}, using defaults", path.display());
            return Ok((PartialConfig::default(), sources));
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "Failed to stat config file {}: {}",
                path.display(),
                e
            ));
        }
    };

    if metadata.uid() != 0 || metadata.mode() & 0o022 != 0 {
        return Err(Error::InvalidConfig(format!(
            "{} must be owned by root and not writable by others",
            path.display()
        ))
        .into());
    }

    let partial = parse_partial(path)?;
    let source = path.display().to_string();
    for (key, set) in [
        ("log_level", partial.log_level.is_some()),
        ("state_dir", partial.state_dir.is_some()),
        ("sysconf_dir", partial.sysconf_dir.is_some()),
        ("tmp_root", partial.tmp_root.is_some()),
        ("max_loop_devices", partial.max_loop_devices.is_some()),
    ] {
        if set {
            sources.insert(key.into(), source.clone());
        }
    }
    trace!("Loaded config file: {}", path.display());
    Ok((partial, sources))
}

fn parse_partial(path: &Path) -> Result<PartialConfig> {
    let config_str = std::fs::read_to_string(path)
        .context(format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&config_str).map_err(|e| {
        Error::InvalidConfig(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
        .into()
    })
}

fn validate_config(config: &Config) -> Result<()> {
    for (key, path) in [
        ("state_dir", &config.state_dir),
        ("sysconf_dir", &config.sysconf_dir),
        ("tmp_root", &config.tmp_root),
    ] {
        if !path.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "{} must be an absolute path: {}",
                key,
                path.display()
            ))
            .into());
        }
    }

    if config.max_loop_devices == 0 {
        return Err(Error::InvalidConfig(
            "max_loop_devices must be at least 1".to_string(),
        )
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EXIT_CONFIG, exit_code_for};
    use clap::Parser;
    use log::LevelFilter;

    fn resolve(argv: &[&str], vars: &[(&str, &str)]) -> Result<Config> {
        let cli = Args::try_parse_from(
            std::iter::once("sexec").chain(argv.iter().copied()),
        )?;
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let lookup = move |key: &str| vars.get(key).cloned();
        resolve_with(cli, PartialConfig::default(), HashMap::new(), &lookup)
    }

    #[test]
    fn test_defaults() -> Result<()> {
        let config = resolve(&[], &[])?;
        assert_eq!(config.image, None);
        assert_eq!(config.command, CommandMode::Shell);
        assert!(!config.writable);
        assert!(!config.contain);
        assert_eq!(config.namespaces, NamespaceOptions::default());
        assert_eq!(config.state_dir, PathBuf::from("/var"));
        assert_eq!(config.mount_point(), PathBuf::from("/var/singularity/mnt"));
        assert_eq!(config.tmp_root, PathBuf::from("/tmp"));
        assert_eq!(config.max_loop_devices, 128);
        assert_eq!(config.log_level, LevelFilter::Info);
        assert_eq!(config.sources.get("image"), Some(&"default".to_string()));
        Ok(())
    }

    #[test]
    fn test_environment() -> Result<()> {
        let config = resolve(
            &["--", "/data"],
            &[
                ("SINGULARITY_IMAGE", "/images/centos.img"),
                ("SINGULARITY_COMMAND", "run"),
                ("SINGULARITY_WRITABLE", ""),
                ("SINGULARITY_CONTAIN", "0"),
                ("SINGULARITY_NO_NAMESPACE_FILES", "1"),
                ("SINGULARITY_LOG_LEVEL", "warn"),
            ],
        )?;
        assert_eq!(config.image, Some(PathBuf::from("/images/centos.img")));
        assert_eq!(config.command, CommandMode::Run);
        // presence is what counts, not the value
        assert!(config.writable);
        assert!(config.contain);
        assert!(config.namespaces.pid);
        assert!(!config.namespaces.files);
        assert_eq!(config.args, vec!["/data".to_string()]);
        assert_eq!(config.log_level, LevelFilter::Warn);
        assert_eq!(
            config.sources.get("writable"),
            Some(&"environment".to_string())
        );
        Ok(())
    }

    #[test]
    fn test_cli_overrides_environment() -> Result<()> {
        let config = resolve(
            &["--image", "/images/b.img", "--command", "shell", "-v"],
            &[
                ("SINGULARITY_IMAGE", "/images/a.img"),
                ("SINGULARITY_COMMAND", "run"),
                ("SINGULARITY_LOG_LEVEL", "warn"),
            ],
        )?;
        assert_eq!(config.image, Some(PathBuf::from("/images/b.img")));
        assert_eq!(config.command, CommandMode::Shell);
        assert_eq!(config.log_level, LevelFilter::Trace);
        assert_eq!(config.sources.get("image"), Some(&"cli".to_string()));
        Ok(())
    }

    #[test]
    fn test_exec_command_sources() -> Result<()> {
        let config = resolve(
            &["--command=exec", "--", "echo $HOME", "extra"],
            &[("SINGULARITY_EXEC", "ignored")],
        )?;
        assert_eq!(config.exec_command.as_deref(), Some("echo $HOME"));
        assert_eq!(config.args, vec!["extra".to_string()]);

        let config = resolve(
            &[],
            &[("SINGULARITY_COMMAND", "exec"), ("SINGULARITY_EXEC", "true")],
        )?;
        assert_eq!(config.exec_command.as_deref(), Some("true"));

        let err = resolve(&["--command=exec"], &[]).expect_err("no command string");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingExecCommand)
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_command_is_a_config_error() {
        let err = resolve(&[], &[("SINGULARITY_COMMAND", "frobnicate")])
            .expect_err("unknown command");
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn test_invalid_log_level() {
        let err = resolve(&[], &[("SINGULARITY_LOG_LEVEL", "chatty")])
            .expect_err("bad level");
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);
    }

    #[test]
    fn test_system_file_values() -> Result<()> {
        let partial: PartialConfig = toml::from_str(
            "log_level = \"debug\"\nstate_dir = \"/srv/state\"\nmax_loop_devices = 8\n",
        )?;
        let cli = Args::try_parse_from(["sexec"])?;
        let lookup = |_: &str| -> Option<String> { None };
        let config = resolve_with(cli, partial, HashMap::new(), &lookup)?;
        assert_eq!(config.mount_point(), PathBuf::from("/srv/state/singularity/mnt"));
        assert_eq!(config.max_loop_devices, 8);
        assert_eq!(config.log_level, LevelFilter::Debug);

        assert!(toml::from_str::<PartialConfig>("image = \"/x.img\"").is_err());
        Ok(())
    }

    #[test]
    fn test_relative_paths_rejected() -> Result<()> {
        let partial: PartialConfig = toml::from_str("tmp_root = \"tmp\"")?;
        let cli = Args::try_parse_from(["sexec"])?;
        let lookup = |_: &str| -> Option<String> { None };
        let err = resolve_with(cli, partial, HashMap::new(), &lookup)
            .expect_err("relative tmp root");
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);
        Ok(())
    }

    #[test]
    fn test_missing_system_file() -> Result<()> {
        let (partial, sources) =
            load_partial(Path::new("/nonexistent/sexec-test/sexec.toml"))?;
        assert!(partial.state_dir.is_none());
        assert!(sources.is_empty());
        Ok(())
    }

    #[test]
    fn test_untrusted_system_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!(
            "sexec-config-{}-{}.toml",
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::write(&path, "state_dir = \"/home/mallory\"\n")?;
        std::fs::set_permissions(
            &path,
            std::os::unix::fs::PermissionsExt::from_mode(0o666),
        )?;
        let err = load_partial(&path).expect_err("world writable config");
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
