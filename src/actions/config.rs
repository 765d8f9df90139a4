#![allow(clippy::option_map_unit_fn)]
use crate::config::Config;
use crate::error::Error;
use crate::outln;
use crate::util::set_json_output;
use anyhow::Result;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;

const ALL_KEYS: [&str; 15] = [
    "image",
    "command",
    "exec_command",
    "writable",
    "contain",
    "no_namespace_pid",
    "no_namespace_fs",
    "no_namespace_files",
    "log_level",
    "state_dir",
    "sysconf_dir",
    "tmp_root",
    "max_loop_devices",
    "mount_point",
    "args",
];

pub fn config(config: &Config, keys: Option<Vec<String>>) -> Result<()> {
    let keys =
        keys.unwrap_or_else(|| ALL_KEYS.map(String::from).to_vec());
    let multi_line = keys.len() > 1;

    for key in keys {
        let (key, value) = lookup(config, &key)?;
        print_config_line(key, &value, multi_line, &config.sources);
    }

    Ok(())
}

/// Resolve a key (dashes or underscores) to its canonical name and value.
fn lookup(config: &Config, key: &str) -> Result<(&'static str, String)> {
    let path = |p: &std::path::Path| p.to_str().unwrap_or("<error>").to_string();
    let key = key.replace('-', "_");
    let canonical = ALL_KEYS
        .iter()
        .find(|k| **k == key)
        .ok_or_else(|| Error::InvalidConfig(format!("Unknown key: {}", key)))?;

    let value = match *canonical {
        "image" => config.image.as_deref().map(path).unwrap_or_default(),
        "command" => config.command.to_string(),
        "exec_command" => config.exec_command.clone().unwrap_or_default(),
        "writable" => config.writable.to_string(),
        "contain" => config.contain.to_string(),
        "no_namespace_pid" => (!config.namespaces.pid).to_string(),
        "no_namespace_fs" => (!config.namespaces.fs).to_string(),
        "no_namespace_files" => (!config.namespaces.files).to_string(),
        "log_level" => config.log_level.as_str().to_string(),
        "state_dir" => path(&config.state_dir),
        "sysconf_dir" => path(&config.sysconf_dir),
        "tmp_root" => path(&config.tmp_root),
        "max_loop_devices" => config.max_loop_devices.to_string(),
        "mount_point" => path(&config.mount_point()),
        _ => config.args.join(" "),
    };
    Ok((canonical, value))
}

fn print_config_line(
    key: &str,
    value: &str,
    multi_line: bool,
    sources: &HashMap<String, String>,
) {
    sources.get(key).map(|s| {
        debug!("{}={} set from {}", key, value, s);
    });
    set_json_output(key, &Value::String(value.to_string()));

    if multi_line {
        outln!("{}={}", key, value);
    } else {
        outln!("{}", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cli::Args;
    use crate::config::resolve::resolve_with;
    use clap::Parser;

    fn resolved(argv: &[&str]) -> Result<Config> {
        let cli = Args::try_parse_from(std::iter::once("sexec").chain(argv.iter().copied()))?;
        resolve_with(cli, Default::default(), Default::default(), &|_: &str| -> Option<String> { None })
    }

    #[test]
    fn test_lookup() -> Result<()> {
        let config = resolved(&["--image", "/images/a.img", "--no-namespace-fs"])?;
        assert_eq!(lookup(&config, "image")?, ("image", "/images/a.img".to_string()));
        assert_eq!(lookup(&config, "mount-point")?.1, "/var/singularity/mnt");
        assert_eq!(lookup(&config, "no_namespace_fs")?.1, "true");
        assert_eq!(lookup(&config, "no_namespace_pid")?.1, "false");
        assert_eq!(lookup(&config, "command")?.1, "shell");
        assert_eq!(lookup(&config, "max_loop_devices")?.1, "128");
        assert!(lookup(&config, "storage_dir").is_err());
        Ok(())
    }

    #[test]
    fn test_unknown_key_fails_the_action() -> Result<()> {
        let config = resolved(&[])?;
        assert!(super::config(&config, Some(vec!["nope".to_string()])).is_err());
        Ok(())
    }
}
