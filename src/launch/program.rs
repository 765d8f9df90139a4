use crate::config::CommandMode;
use crate::error::Error;
use anyhow::{Context, Result};
use log::info;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

pub const SHELL: &str = "/bin/sh";
pub const RUNSCRIPT: &str = "/singularity";

/// Inputs of a launch that must never leak into the container.
const SCRUBBED: [&str; 3] =
    ["SINGULARITY_IMAGE", "SINGULARITY_COMMAND", "SINGULARITY_EXEC"];

/// What the container child execs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub path: CString,
    pub argv: Vec<CString>,
}

impl Program {
    fn new<S: AsRef<str>>(path: &str, argv: &[S]) -> Result<Program> {
        Ok(Program {
            path: CString::new(path)?,
            argv: argv
                .iter()
                .map(|arg| {
                    CString::new(arg.as_ref())
                        .context(format!("Argument contains a NUL byte: {:?}", arg.as_ref()))
                })
                .collect::<Result<_>>()?,
        })
    }

    fn shell(args: &[String]) -> Result<Program> {
        let argv: Vec<&str> = std::iter::once(SHELL)
            .chain(args.iter().map(String::as_str))
            .collect();
        Program::new(SHELL, &argv)
    }
}

/**
 * Pick the program for a command mode. `runscript_executable` says whether
 * `/singularity` exists and is executable inside the container root.
 */
pub fn resolve(
    mode: &CommandMode,
    args: &[String],
    exec_command: Option<&str>,
    runscript_executable: bool,
) -> Result<Program> {
    match mode {
        CommandMode::Shell => {
            info!("No command specified, launching 'shell'");
            Program::shell(args)
        }
        CommandMode::Run if runscript_executable => {
            let argv: Vec<&str> = std::iter::once(RUNSCRIPT)
                .chain(args.iter().map(String::as_str))
                .collect();
            Program::new(RUNSCRIPT, &argv)
        }
        CommandMode::Run => {
            info!("No Singularity runscript found, launching 'shell'");
            Program::shell(args)
        }
        CommandMode::Exec => {
            let command = exec_command.ok_or(Error::MissingExecCommand)?;
            let mut argv = vec!["Singularity", "-c", command];
            // Extra arguments become $1.. of the inline command
            if !args.is_empty() {
                argv.push("Singularity");
                argv.extend(args.iter().map(String::as_str));
            }
            Program::new(SHELL, &argv)
        }
    }
}

/**
 * The environment handed to the container: our own minus the launch
 * inputs, with a prompt naming the image and `SINGULARITY_CONTAINER` set
 * unless the caller already set it.
 */
pub fn container_env<I>(vars: I, image_name: &OsStr) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env = Vec::new();
    let mut has_container = false;

    for (key, value) in vars {
        if SCRUBBED.iter().any(|scrubbed| key == *scrubbed) || key == "PS1" {
            continue;
        }
        if key == "SINGULARITY_CONTAINER" {
            has_container = true;
        }
        env.push(pair(key.as_bytes(), value.as_bytes())?);
    }

    let mut prompt = b"Singularity/".to_vec();
    prompt.extend_from_slice(image_name.as_bytes());
    prompt.extend_from_slice(b"> ");
    env.push(pair(b"PS1", &prompt)?);

    if !has_container {
        env.push(pair(b"SINGULARITY_CONTAINER", b"true")?);
    }
    Ok(env)
}

fn pair(key: &[u8], value: &[u8]) -> Result<CString> {
    let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
    entry.extend_from_slice(key);
    entry.push(b'=');
    entry.extend_from_slice(value);
    Ok(CString::new(entry)?)
}
