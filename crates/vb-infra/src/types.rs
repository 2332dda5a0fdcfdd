use std::fmt;

use serde::{Deserialize, Serialize};

/// Backend-side container identifier. Assigned once when the record is
/// created and the only handle ever passed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opt-in isolation relaxations requested for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub nesting: bool,
    pub kvm: bool,
    pub fuse: bool,
    pub docker: bool,
}

impl Features {
    /// The flags to apply, in application order. Docker always brings
    /// nesting along with it.
    pub fn requested(&self) -> Vec<Feature> {
        let mut out = Vec::new();
        if self.nesting || self.docker {
            out.push(Feature::Nesting);
        }
        if self.kvm {
            out.push(Feature::Kvm);
        }
        if self.fuse {
            out.push(Feature::Fuse);
        }
        if self.docker {
            out.push(Feature::Docker);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Nesting,
    Kvm,
    Fuse,
    Docker,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nesting => "nesting",
            Self::Kvm => "kvm",
            Self::Fuse => "fuse",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend-specific image address produced by `ContainerBackend::resolve_image`.
///
/// The modern runtime addresses images as `remote:distro/release`; the
/// classic download template takes distro, release and arch separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub distro: String,
    pub release: String,
    pub arch: String,
    pub remote: Option<String>,
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote {
            Some(remote) => write!(f, "{remote}:{}/{}", self.distro, self.release),
            None => write!(f, "{}/{}/{}", self.distro, self.release, self.arch),
        }
    }
}

/// Everything `create` needs to provision a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: ImageRef,
    pub cpu: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    pub features: Features,
}

/// Usage counters in the units the runtime reports natively:
/// cumulative CPU time in nanoseconds and current memory charge in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub cpu_time_ns: u64,
    pub memory_bytes: u64,
}

/// Captured output of a non-interactive command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Host-side program and arguments that open an interactive shell inside
/// a container. The caller attaches it to a pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Prefer bash, fall back to sh on minimal images such as alpine.
pub(crate) const LOGIN_SHELL: &str =
    "if command -v bash >/dev/null 2>&1; then exec bash -l; else exec sh -l; fi";

/// Quote `value` for a POSIX shell single-quoted string.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_implies_nesting_once() {
        let features = Features {
            nesting: true,
            docker: true,
            ..Default::default()
        };
        assert_eq!(features.requested(), vec![Feature::Nesting, Feature::Docker]);

        let docker_only = Features {
            docker: true,
            ..Default::default()
        };
        assert_eq!(docker_only.requested(), vec![Feature::Nesting, Feature::Docker]);
        assert!(Features::default().requested().is_empty());
    }

    #[test]
    fn image_ref_display_per_family() {
        let mut image = ImageRef {
            distro: "debian".into(),
            release: "12".into(),
            arch: "amd64".into(),
            remote: Some("images".into()),
        };
        assert_eq!(image.to_string(), "images:debian/12");
        image.remote = None;
        assert_eq!(image.to_string(), "debian/12/amd64");
    }

    #[test]
    fn quotes_embedded_single_quotes() {
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }
}
