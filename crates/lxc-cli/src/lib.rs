//! Typed async wrapper around the classic LXC userspace tools.
//!
//! Covers `lxc-create` (download template), `lxc-start`, `lxc-stop`,
//! `lxc-destroy`, `lxc-info` and `lxc-attach`, plus direct edits of the
//! per-container config file and reads of raw cgroup accounting files.
//! None of these tools emit structured output, so parsing is tolerant and
//! degrades to empty values.

mod cgroup;
mod config;
mod info;

pub use cgroup::Counters;
pub use config::ConfigBlock;
pub use info::ContainerInfo;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Seconds `lxc-stop` waits for a clean shutdown before killing.
const STOP_GRACE_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` exited with status {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("container {0} is not defined")]
    NotDefined(String),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    fn stderr_contains(&self, needles: &[&str]) -> bool {
        match self {
            Error::Command { stderr, .. } => {
                let stderr = stderr.to_ascii_lowercase();
                needles.iter().any(|n| stderr.contains(n))
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotDefined(_))
            || self.stderr_contains(&["doesn't exist", "does not exist", "not defined"])
    }

    pub fn is_not_running(&self) -> bool {
        self.stderr_contains(&["not running"])
    }

    pub fn is_already_running(&self) -> bool {
        self.stderr_contains(&["already running"])
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Image selector for the `download` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadImage {
    pub distro: String,
    pub release: String,
    pub arch: String,
}

/// Client for the `lxc-*` tool family.
#[derive(Debug, Clone)]
pub struct LxcClient {
    tools_dir: Option<PathBuf>,
    lxc_path: PathBuf,
    cgroup_root: PathBuf,
    timeout: Duration,
    create_timeout: Duration,
}

impl LxcClient {
    /// `lxc_path` is the container store (usually `/var/lib/lxc`),
    /// `cgroup_root` the cgroup mount point (usually `/sys/fs/cgroup`).
    pub fn new(lxc_path: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            tools_dir: None,
            lxc_path: lxc_path.into(),
            cgroup_root: cgroup_root.into(),
            timeout: DEFAULT_TIMEOUT,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
        }
    }

    /// Resolve `lxc-*` binaries from `dir` instead of `$PATH`.
    pub fn with_tools_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tools_dir = Some(dir.into());
        self
    }

    pub fn with_timeouts(mut self, timeout: Duration, create_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.create_timeout = create_timeout;
        self
    }

    pub fn tool(&self, name: &str) -> String {
        match &self.tools_dir {
            Some(dir) => dir.join(name).to_string_lossy().into_owned(),
            None => name.to_string(),
        }
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.lxc_path.join(name).join("config")
    }

    pub fn rootfs_path(&self, name: &str) -> PathBuf {
        self.lxc_path.join(name).join("rootfs")
    }

    /// Run a tool and return `(stdout, stderr)`.
    async fn output(&self, tool: &str, args: &[&str], timeout: Duration) -> Result<(String, String)> {
        let program = self.tool(tool);
        let command = describe(tool, args);
        tracing::debug!(%command, "lxc: running");

        let child = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| Error::Spawn { program, source })?,
            Err(_) => return Err(Error::Timeout { command, timeout }),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(Error::Command {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok((stdout, stderr))
    }

    async fn run(&self, tool: &str, args: &[&str], timeout: Duration) -> Result<String> {
        let (stdout, _) = self.output(tool, args, timeout).await?;
        Ok(stdout)
    }

    pub async fn version(&self) -> Result<String> {
        let out = self.run("lxc-create", &["--version"], self.timeout).await?;
        Ok(out.trim().to_string())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Create a container through the `download` template.
    pub async fn create_download(
        &self,
        name: &str,
        image: &DownloadImage,
        validate: bool,
    ) -> Result<()> {
        let mut args = vec![
            "-n",
            name,
            "-t",
            "download",
            "--",
            "-d",
            image.distro.as_str(),
            "-r",
            image.release.as_str(),
            "-a",
            image.arch.as_str(),
        ];
        if !validate {
            args.push("--no-validate");
        }
        self.run("lxc-create", &args, self.create_timeout).await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.run("lxc-start", &["-n", name, "-d"], self.timeout)
            .await?;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let grace = STOP_GRACE_SECS.to_string();
        self.run(
            "lxc-stop",
            &["-n", name, "-t", grace.as_str()],
            self.timeout + Duration::from_secs(STOP_GRACE_SECS),
        )
        .await?;
        Ok(())
    }

    /// Destroy a container, stopping it first if it is running.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        self.run(
            "lxc-destroy",
            &["-n", name, "-f"],
            self.timeout + Duration::from_secs(STOP_GRACE_SECS),
        )
        .await?;
        Ok(())
    }

    pub async fn info(&self, name: &str) -> Result<ContainerInfo> {
        let out = self.run("lxc-info", &["-n", name], self.timeout).await?;
        Ok(ContainerInfo::parse(&out))
    }

    /// Whether the container is defined, judged by its config file.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.config_path(name);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| Error::Io { path, source })
    }

    // ── Attach ───────────────────────────────────────────────────────

    /// Run `argv` inside the container and return `(stdout, stderr)`.
    pub async fn attach(&self, name: &str, argv: &[&str]) -> Result<(String, String)> {
        let mut args = vec!["-n", name, "--"];
        args.extend_from_slice(argv);
        self.output("lxc-attach", &args, self.timeout).await
    }

    /// Program and arguments for an interactive `lxc-attach` session. The
    /// caller attaches the child to a pseudo-terminal.
    pub fn interactive_attach(&self, name: &str, argv: &[&str]) -> (String, Vec<String>) {
        let mut args: Vec<String> = vec![
            "-n".into(),
            name.into(),
            "--set-var".into(),
            "TERM=xterm-256color".into(),
            "--".into(),
        ];
        args.extend(argv.iter().map(|s| s.to_string()));
        (self.tool("lxc-attach"), args)
    }

    // ── Config file and rootfs ───────────────────────────────────────

    /// Append a block to the container's config file. Takes effect on the
    /// next start.
    pub async fn append_config(&self, name: &str, block: &ConfigBlock) -> Result<()> {
        let path = self.config_path(name);
        let mut file = match tokio::fs::OpenOptions::new().append(true).open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotDefined(name.to_string()));
            }
            Err(source) => return Err(Error::Io { path, source }),
        };

        file.write_all(block.render().as_bytes())
            .await
            .map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
        file.flush()
            .await
            .map_err(|source| Error::Io { path, source })?;

        tracing::debug!(container = name, block = block.title(), "lxc: config appended");
        Ok(())
    }

    /// Replace a file inside the container's rootfs. A symlink at the target
    /// is removed rather than followed, since its target would resolve on
    /// the host.
    pub async fn write_rootfs_file(&self, name: &str, relative: &Path, contents: &str) -> Result<()> {
        let rootfs = self.rootfs_path(name);
        if !tokio::fs::try_exists(&rootfs).await.unwrap_or(false) {
            return Err(Error::NotDefined(name.to_string()));
        }
        let path = rootfs.join(relative);

        if let Ok(meta) = tokio::fs::symlink_metadata(&path).await
            && meta.file_type().is_symlink()
        {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| Error::Io { path, source })
    }

    pub async fn counters(&self, name: &str) -> Counters {
        cgroup::read_counters(&self.cgroup_root, name).await
    }
}

fn describe(tool: &str, args: &[&str]) -> String {
    let mut parts = vec![tool];
    for arg in args {
        if *arg == "--" && tool == "lxc-attach" {
            parts.push("-- …");
            break;
        }
        parts.push(arg);
    }
    parts.join(" ")
}
