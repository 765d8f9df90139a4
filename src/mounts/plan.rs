use std::path::{Path, PathBuf};

/// What happens when a bind cannot be performed because its source or
/// target is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Abort the launch.
    Required,
    /// Skip silently.
    Optional,
    /// Skip, but let the user know.
    Expected,
}

/// One bind mount of a host (or generated) path onto a path inside the
/// container root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub source: PathBuf,
    /// Absolute path as seen from inside the container.
    pub target: PathBuf,
    pub writable: bool,
    pub presence: Presence,
}

impl BindSpec {
    fn new(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        writable: bool,
        presence: Presence,
    ) -> BindSpec {
        BindSpec {
            source: source.into(),
            target: target.into(),
            writable,
            presence,
        }
    }
}

/// Everything the bind plan depends on.
#[derive(Debug, Clone)]
pub struct PlanInputs<'a> {
    pub sysconf_dir: &'a Path,
    pub passwd_template: &'a Path,
    pub group_template: &'a Path,
    pub base_home: &'a Path,
    /// `Some(state_dir)` when the container gets private tmp and home.
    pub contained_in: Option<&'a Path>,
}

/// The ordered list of binds applied after the image root is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    pub binds: Vec<BindSpec>,
}

impl MountPlan {
    pub fn build(inputs: &PlanInputs) -> MountPlan {
        let mut binds = vec![
            BindSpec::new("/dev", "/dev", false, Presence::Required),
            BindSpec::new(
                "/etc/resolv.conf",
                "/etc/resolv.conf",
                false,
                Presence::Required,
            ),
            BindSpec::new("/etc/hosts", "/etc/hosts", false, Presence::Optional),
            BindSpec::new(
                inputs.passwd_template,
                "/etc/passwd",
                false,
                Presence::Optional,
            ),
            BindSpec::new(
                inputs.group_template,
                "/etc/group",
                false,
                Presence::Optional,
            ),
            BindSpec::new(
                inputs
                    .sysconf_dir
                    .join("singularity/default-nsswitch.conf"),
                "/etc/nsswitch.conf",
                false,
                Presence::Expected,
            ),
        ];

        match inputs.contained_in {
            None => {
                binds.push(BindSpec::new("/tmp", "/tmp", true, Presence::Optional));
                binds.push(BindSpec::new(
                    "/var/tmp",
                    "/var/tmp",
                    true,
                    Presence::Optional,
                ));
                binds.push(BindSpec::new(
                    inputs.base_home,
                    inputs.base_home,
                    true,
                    Presence::Expected,
                ));
            }
            Some(state_dir) => {
                let tmp = state_dir.join("tmp");
                binds.push(BindSpec::new(&tmp, "/tmp", true, Presence::Optional));
                binds.push(BindSpec::new(
                    &tmp,
                    "/var/tmp",
                    true,
                    Presence::Optional,
                ));
                binds.push(BindSpec::new(
                    contained_home_source(state_dir, inputs.base_home),
                    inputs.base_home,
                    true,
                    Presence::Expected,
                ));
            }
        }

        MountPlan { binds }
    }
}

/// Where the private copy of the home tree lives inside the state dir.
pub fn contained_home_source(state_dir: &Path, base_home: &Path) -> PathBuf {
    crate::util::join_inside(state_dir, base_home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(contained_in: Option<&Path>) -> PlanInputs<'_> {
        PlanInputs {
            sysconf_dir: Path::new("/etc"),
            passwd_template: Path::new("/tmp/.singularity-1.2.3/passwd"),
            group_template: Path::new("/tmp/.singularity-1.2.3/group"),
            base_home: Path::new("/home"),
            contained_in,
        }
    }

    fn targets(plan: &MountPlan) -> Vec<&str> {
        plan.binds
            .iter()
            .map(|b| b.target.to_str().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_host_plan_order() {
        let plan = MountPlan::build(&inputs(None));
        assert_eq!(
            targets(&plan),
            vec![
                "/dev",
                "/etc/resolv.conf",
                "/etc/hosts",
                "/etc/passwd",
                "/etc/group",
                "/etc/nsswitch.conf",
                "/tmp",
                "/var/tmp",
                "/home",
            ]
        );
        assert_eq!(plan.binds[6].source, PathBuf::from("/tmp"));
        assert_eq!(plan.binds[8].source, PathBuf::from("/home"));
        assert_eq!(
            plan.binds[5].source,
            PathBuf::from("/etc/singularity/default-nsswitch.conf")
        );
    }

    #[test]
    fn test_required_binds() {
        let plan = MountPlan::build(&inputs(None));
        let required: Vec<_> = plan
            .binds
            .iter()
            .filter(|b| b.presence == Presence::Required)
            .map(|b| b.target.clone())
            .collect();
        assert_eq!(
            required,
            vec![PathBuf::from("/dev"), PathBuf::from("/etc/resolv.conf")]
        );
    }

    #[test]
    fn test_contained_plan_uses_state_dir() {
        let state_dir = Path::new("/tmp/.singularity-1.2.3");
        let plan = MountPlan::build(&inputs(Some(state_dir)));
        let tail: Vec<_> = plan.binds[6..]
            .iter()
            .map(|b| (b.source.clone(), b.target.clone()))
            .collect();
        assert_eq!(
            tail,
            vec![
                (state_dir.join("tmp"), PathBuf::from("/tmp")),
                (state_dir.join("tmp"), PathBuf::from("/var/tmp")),
                (state_dir.join("home"), PathBuf::from("/home")),
            ]
        );
    }

    #[test]
    fn test_identity_files_are_read_only() {
        let plan = MountPlan::build(&inputs(None));
        for bind in &plan.binds {
            if bind.target.starts_with("/etc") {
                assert!(!bind.writable, "{} should be read-only", bind.target.display());
            }
        }
    }
}
