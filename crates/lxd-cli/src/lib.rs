//! Typed async wrapper around the LXD `lxc` command-line client.
//!
//! Covers the subset needed for managing tenant containers:
//! instances (init, start, stop, restart, delete, list), config keys,
//! devices, and non-interactive exec. Every invocation runs as a child
//! process bounded by a timeout.

mod types;

pub use types::*;

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

pub const DEFAULT_PROGRAM: &str = "lxc";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(300);

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

    #[error("unexpected lxc output: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Error {
    fn stderr_contains(&self, needle: &str) -> bool {
        match self {
            Error::Command { stderr, .. } => stderr.to_ascii_lowercase().contains(needle),
            _ => false,
        }
    }

    /// The instance addressed by the command does not exist. Missing
    /// devices, profiles or images are not covered.
    pub fn is_not_found(&self) -> bool {
        self.stderr_contains("instance not found")
    }

    pub fn is_already_running(&self) -> bool {
        self.stderr_contains("already running")
    }

    pub fn is_already_stopped(&self) -> bool {
        self.stderr_contains("already stopped") || self.stderr_contains("is not running")
    }

    pub fn is_already_exists(&self) -> bool {
        self.stderr_contains("already exists")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the `lxc` binary shipped with LXD (and Incus-compatible forks).
#[derive(Debug, Clone)]
pub struct LxdClient {
    program: String,
    timeout: Duration,
    create_timeout: Duration,
}

impl LxdClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TIMEOUT,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
        }
    }

    /// Override the per-command timeout and the longer one used for `init`.
    pub fn with_timeouts(mut self, timeout: Duration, create_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.create_timeout = create_timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Render a command for logs. Everything after `--` is elided since exec
    /// payloads may carry credentials.
    fn describe(&self, args: &[&str]) -> String {
        let mut parts = vec![self.program.as_str()];
        for arg in args {
            if *arg == "--" {
                parts.push("-- …");
                break;
            }
            parts.push(arg);
        }
        parts.join(" ")
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let command = self.describe(args);
        tracing::debug!(%command, "lxd: running");

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })?,
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

        Ok(CommandOutput { stdout, stderr })
    }

    pub async fn version(&self) -> Result<String> {
        let out = self.run(&["--version"], self.timeout).await?;
        Ok(out.stdout.trim().to_string())
    }

    // ── Instances ────────────────────────────────────────────────────

    /// Create an instance from `image` without starting it.
    pub async fn init(&self, image: &str, name: &str, storage_pool: Option<&str>) -> Result<()> {
        let mut args = vec!["init", image, name];
        if let Some(pool) = storage_pool {
            args.extend(["--storage", pool]);
        }
        self.run(&args, self.create_timeout).await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.run(&["start", name], self.timeout).await?;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.run(&["stop", name], self.timeout).await?;
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        self.run(&["restart", name], self.timeout).await?;
        Ok(())
    }

    /// Delete an instance. With `force`, a running instance is stopped first.
    pub async fn delete(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["delete", name];
        if force {
            args.push("--force");
        }
        self.run(&args, self.timeout).await?;
        Ok(())
    }

    /// Fetch a single instance by exact name, or `None` if it does not exist.
    ///
    /// `lxc list` treats its filter as a name prefix, so the result is
    /// narrowed to the exact match here.
    pub async fn instance(&self, name: &str) -> Result<Option<Instance>> {
        let out = self
            .run(&["list", name, "--format", "json"], self.timeout)
            .await?;
        let instances = parse_instances(&out.stdout)?;
        Ok(instances.into_iter().find(|i| i.name == name))
    }

    // ── Configuration ────────────────────────────────────────────────

    pub async fn config_set(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.run(&["config", "set", name, key, value], self.timeout)
            .await?;
        Ok(())
    }

    pub async fn device_add(
        &self,
        name: &str,
        device: &str,
        kind: &str,
        props: &[(&str, &str)],
    ) -> Result<()> {
        let props: Vec<String> = props.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec!["config", "device", "add", name, device, kind];
        args.extend(props.iter().map(String::as_str));
        self.run(&args, self.timeout).await?;
        Ok(())
    }

    /// Copy a profile-inherited device onto the instance with new properties.
    pub async fn device_override(
        &self,
        name: &str,
        device: &str,
        props: &[(&str, &str)],
    ) -> Result<()> {
        let props: Vec<String> = props.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec!["config", "device", "override", name, device];
        args.extend(props.iter().map(String::as_str));
        self.run(&args, self.timeout).await?;
        Ok(())
    }

    pub async fn device_set(&self, name: &str, device: &str, key: &str, value: &str) -> Result<()> {
        self.run(&["config", "device", "set", name, device, key, value], self.timeout)
            .await?;
        Ok(())
    }

    // ── Exec ─────────────────────────────────────────────────────────

    /// Run `argv` inside the instance and capture its output.
    pub async fn exec(&self, name: &str, argv: &[&str]) -> Result<CommandOutput> {
        let mut args = vec!["exec", name, "--"];
        args.extend_from_slice(argv);
        self.run(&args, self.timeout).await
    }

    /// Arguments for an interactive `lxc exec` session. The caller attaches
    /// the child to a pseudo-terminal.
    pub fn interactive_exec_args(&self, name: &str, argv: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = ["exec", "--force-interactive", "--env", "TERM=xterm-256color", name, "--"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(argv.iter().map(|s| s.to_string()));
        args
    }
}

impl Default for LxdClient {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

/// Parse `lxc list --format json` output. Blank output means no instances.
pub fn parse_instances(json: &str) -> Result<Vec<Instance>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Write an executable shell script standing in for the `lxc` binary.
    fn fake_lxc(dir: &Path, body: &str) -> String {
        let path = dir.join("lxc");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_lxc(dir.path(), "echo 'Error: Instance not found' >&2\nexit 1");
        let client = LxdClient::new(program);

        let err = client.delete("vps-gone", true).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
        assert!(matches!(err, Error::Command { code: 1, .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_lxc(dir.path(), "sleep 5");
        let client = LxdClient::new(program)
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(100));

        let err = client.start("vps-slow").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let client = LxdClient::new("/nonexistent/lxc-binary");
        let err = client.version().await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn instance_lookup_requires_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_lxc(
            dir.path(),
            r#"echo '[{"name":"vps-a-web2","status":"Running"},{"name":"vps-a-web","status":"Stopped"}]'"#,
        );
        let client = LxdClient::new(program);

        let found = client.instance("vps-a-web").await.unwrap().unwrap();
        assert_eq!(found.status, "Stopped");
        assert!(client.instance("vps-a").await.unwrap().is_none());
    }

    #[test]
    fn describe_elides_exec_payload() {
        let client = LxdClient::default();
        let rendered = client.describe(&["exec", "vps-1", "--", "sh", "-c", "echo root:secret | chpasswd"]);
        assert_eq!(rendered, "lxc exec vps-1 -- …");
    }

    #[test]
    fn only_a_missing_instance_is_not_found() {
        let command_error = |stderr: &str| Error::Command {
            command: "lxc config device remove vps-1 eth1".into(),
            code: 1,
            stderr: stderr.into(),
        };

        assert!(command_error("Error: Instance not found").is_not_found());
        assert!(!command_error("Error: Device not found").is_not_found());
        assert!(!command_error("Error: Profile not found").is_not_found());
    }

    #[test]
    fn blank_list_output_is_empty() {
        assert!(parse_instances("  \n").unwrap().is_empty());
    }
}
