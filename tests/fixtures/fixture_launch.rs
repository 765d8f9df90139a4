use anyhow::Result;
use rand::Rng;
use rstest::*;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};

/// Image used by the end to end tests. It needs at least `/bin/sh`,
/// `/dev`, `/etc/resolv.conf` and `/tmp`.
#[allow(dead_code)]
pub const TEST_IMAGE_VAR: &str = "SEXEC_TEST_IMAGE";

/// Launch inputs that would leak in from the developer's shell.
const LAUNCH_VARS: [&str; 9] = [
    "SINGULARITY_IMAGE",
    "SINGULARITY_COMMAND",
    "SINGULARITY_EXEC",
    "SINGULARITY_WRITABLE",
    "SINGULARITY_CONTAIN",
    "SINGULARITY_NO_NAMESPACE_PID",
    "SINGULARITY_NO_NAMESPACE_FS",
    "SINGULARITY_NO_NAMESPACE_FILES",
    "SINGULARITY_LOG_LEVEL",
];

#[allow(dead_code)]
pub fn rid() -> String {
    let mut rng = rand::rng();
    let rid: String = (0..10)
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect();
    rid
}

pub fn get_sexec_bin() -> String {
    let cargo_manifest_dir = std::env::var("CARGO_MANIFEST_DIR")
        .unwrap_or_else(|_| ".".to_string());
    let path = Path::new(&cargo_manifest_dir).join("target/debug/sexec");
    let absolute_path = path.canonicalize().unwrap_or_else(|_| path.clone());
    absolute_path.to_string_lossy().to_string()
}

#[allow(dead_code)]
fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[allow(dead_code)]
fn have_passwordless_sudo() -> bool {
    Command::new("sudo")
        .args(["-n", "true"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

pub struct LaunchManager {
    pub last_stdout: String,
    pub last_stderr: String,
    pub last_code: Option<i32>,
    /// Run the binary directly instead of through `sudo -E`.
    pub no_sudo: bool,
    pub sexec_bin: String,
    env: Vec<(String, String)>,
}

impl LaunchManager {
    pub fn new() -> Self {
        Self {
            last_stdout: String::new(),
            last_stderr: String::new(),
            last_code: None,
            no_sudo: true,
            sexec_bin: get_sexec_bin(),
            env: Vec::new(),
        }
    }

    /**
     * Set up for real launches. Returns the image to launch, or `None`
     * when this host cannot run them (no root, no test image), in which
     * case the test should return early.
     */
    #[allow(dead_code)]
    pub fn privileged(&mut self) -> Option<PathBuf> {
        let image = std::env::var(TEST_IMAGE_VAR).ok().map(PathBuf::from)?;
        if !image.is_file() {
            println!("{} does not name an image, skipping", image.display());
            return None;
        }
        if is_root() {
            self.no_sudo = true;
        } else if have_passwordless_sudo() {
            self.no_sudo = false;
        } else {
            println!("Launch tests need root or passwordless sudo, skipping");
            return None;
        }
        Some(image)
    }

    #[allow(dead_code)]
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.push((key.to_string(), value.to_string()));
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = if self.no_sudo {
            Command::new(&self.sexec_bin)
        } else {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "-E", &self.sexec_bin]);
            cmd
        };
        for key in LAUNCH_VARS {
            cmd.env_remove(key);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.args(args);
        println!(
            "Running command: {} {}",
            cmd.get_program().to_string_lossy(),
            cmd.get_args()
                .map(|c| c.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        cmd
    }

    /// Run to completion, recording output and exit code.
    pub fn run(&mut self, args: &[&str]) -> Result<Output> {
        let output = self.command(args).output()?;
        self.last_stdout = String::from_utf8_lossy(&output.stdout).to_string();
        self.last_stderr = String::from_utf8_lossy(&output.stderr).to_string();
        self.last_code = output.status.code();
        Ok(output)
    }

    #[allow(dead_code)]
    pub fn run_in_background(&mut self, args: &[&str]) -> Result<Child> {
        Ok(self
            .command(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?)
    }

    /// Run and expect a particular exit code.
    pub fn code(&mut self, args: &[&str]) -> Option<i32> {
        if let Err(e) = self.run(args) {
            println!("Command failed to run: {}", e);
            return None;
        }
        if self.last_code != Some(0) {
            println!("last_stderr: {}", self.last_stderr);
            println!("last_stdout: {}", self.last_stdout);
        }
        self.last_code
    }

    pub fn pass(&mut self, args: &[&str]) -> bool {
        self.code(args) == Some(0)
    }

    #[allow(dead_code)]
    pub fn xfail(&mut self, args: &[&str]) -> bool {
        !matches!(self.code(args), Some(0) | None)
    }
}

#[fixture]
pub fn launcher() -> LaunchManager {
    LaunchManager::new()
}
