//! Pseudo-terminal backed child processes for interactive shells.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use vb_infra::types::ShellCommand;

const READ_CHUNK: usize = 4096;

/// Input chunks queued for the terminal before further input is refused.
const INPUT_QUEUE: usize = 256;

/// How long to keep reading output after the child exits. Background jobs
/// that inherited the terminal would otherwise hold it open forever.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on waiting for a killed child to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Output(Bytes),
    /// The child exited on its own. Sent at most once, after all output.
    Exited(Option<i32>),
}

/// Non-blocking PTY master registered with the reactor. Shared by the
/// output pump, the input writer and resize.
struct Master {
    inner: AsyncFd<OwnedFd>,
}

impl Master {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        // SAFETY: F_GETFL/F_SETFL on a descriptor we own.
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                // SAFETY: `buf` is valid for `buf.len()` bytes.
                let n = unsafe { libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| {
                // SAFETY: `buf` is valid for `buf.len()` bytes.
                let n = unsafe { libc::write(inner.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let winsize = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads a winsize struct from a valid PTY master.
        let ret = unsafe { libc::ioctl(self.inner.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// An interactive process attached to the slave side of a fresh PTY.
///
/// Dropping the handle kills the process. A process that exits on its own
/// reports [`ShellEvent::Exited`]; a killed one reports nothing.
pub struct ShellProcess {
    pid: Option<u32>,
    master: Arc<Master>,
    input: mpsc::Sender<Bytes>,
    kill_tx: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

impl ShellProcess {
    pub fn spawn(shell: &ShellCommand, cols: u16, rows: u16) -> io::Result<(Self, mpsc::Receiver<ShellEvent>)> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } = openpty(Some(&winsize), None).map_err(io::Error::from)?;
        // Only the stdio copies of the slave may survive exec.
        set_cloexec(master.as_raw_fd())?;
        set_cloexec(slave.as_raw_fd())?;

        let mut command = Command::new(&shell.program);
        command
            .args(&shell.args)
            .env("TERM", "xterm-256color")
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave))
            .kill_on_drop(true);

        // SAFETY: only async-signal-safe calls between fork and exec. The
        // child gets its own session with the PTY slave (already on fd 0)
        // as controlling terminal.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        // Release the parent's copies of the slave so reads see EOF on exit.
        drop(command);

        let pid = child.id();
        let master = Arc::new(Master::new(master)?);

        let (events_tx, events_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, pid, master.clone(), events_tx, input_rx, kill_rx));

        tracing::debug!(?pid, program = %shell.program, cols, rows, "pty: shell spawned");

        Ok((
            Self {
                pid,
                master,
                input: input_tx,
                kill_tx: Some(kill_tx),
                supervisor,
            },
            events_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue raw bytes for the terminal input. Never waits on the terminal:
    /// a shell that stops reading fills the queue and further input is
    /// refused with `WouldBlock`.
    pub fn write(&self, data: Bytes) -> io::Result<()> {
        self.input.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "terminal input queue full")
            }
            mpsc::error::TrySendError::Closed(_) => io::ErrorKind::BrokenPipe.into(),
        })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        self.master.resize(cols, rows)
    }

    /// Kill the process and wait (bounded) until it has been reaped.
    pub async fn terminate(mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(KILL_WAIT, &mut self.supervisor).await.is_err() {
            tracing::warn!(pid = ?self.pid, "pty: shell not reaped in time");
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    master: Arc<Master>,
    events: mpsc::Sender<ShellEvent>,
    input: mpsc::Receiver<Bytes>,
    kill_rx: oneshot::Receiver<()>,
) {
    let mut pump = tokio::spawn(pump_output(master.clone(), events.clone()));
    let writer = tokio::spawn(write_input(master, input));

    tokio::select! {
        status = child.wait() => {
            writer.abort();
            // Let trailing output reach the client before the exit notice.
            if tokio::time::timeout(DRAIN_GRACE, &mut pump).await.is_err() {
                pump.abort();
            }
            let code = status.ok().and_then(exit_code);
            tracing::debug!(?pid, ?code, "pty: shell exited");
            let _ = events.send(ShellEvent::Exited(code)).await;
        }
        // Fires on an explicit kill and when the handle is dropped.
        _ = kill_rx => {
            writer.abort();
            if let Some(pid) = pid {
                // Hang up the whole session first so the shell's children go too.
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGHUP);
            }
            if let Err(e) = child.kill().await {
                tracing::warn!(?pid, error = %e, "pty: kill failed");
            }
            pump.abort();
            tracing::debug!(?pid, "pty: shell killed");
        }
    }
}

async fn pump_output(master: Arc<Master>, events: mpsc::Sender<ShellEvent>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match master.read(&mut buf).await {
            // EIO once the last slave descriptor closes.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if events
                    .send(ShellEvent::Output(Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn write_input(master: Arc<Master>, mut input: mpsc::Receiver<Bytes>) {
    while let Some(data) = input.recv().await {
        if let Err(e) = master.write_all(&data).await {
            tracing::debug!(error = %e, "pty: input write failed");
            break;
        }
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ShellCommand {
        ShellCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    async fn collect(events: &mut mpsc::Receiver<ShellEvent>) -> (Vec<u8>, Option<Option<i32>>) {
        let mut output = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            match event {
                ShellEvent::Output(b) => output.extend_from_slice(&b),
                ShellEvent::Exited(code) => return (output, Some(code)),
            }
        }
        (output, None)
    }

    fn is_gone(pid: i32) -> bool {
        nix::sys::signal::kill(Pid::from_raw(pid), None) == Err(nix::errno::Errno::ESRCH)
    }

    #[tokio::test]
    async fn output_then_exit_code() {
        let (_proc, mut events) = ShellProcess::spawn(&sh("printf hello; exit 3"), 80, 24).unwrap();
        let (output, exit) = collect(&mut events).await;
        assert!(String::from_utf8_lossy(&output).contains("hello"));
        assert_eq!(exit, Some(Some(3)));
    }

    #[tokio::test]
    async fn runs_with_a_controlling_terminal_of_requested_size() {
        let (_proc, mut events) =
            ShellProcess::spawn(&sh("test -t 0 && stty size"), 132, 40).unwrap();
        let (output, exit) = collect(&mut events).await;
        assert!(String::from_utf8_lossy(&output).contains("40 132"));
        assert_eq!(exit, Some(Some(0)));
    }

    #[tokio::test]
    async fn input_reaches_the_process() {
        let (proc, mut events) = ShellProcess::spawn(&sh("read line; echo got:$line"), 80, 24).unwrap();
        proc.write(Bytes::from_static(b"ping\n")).unwrap();
        let (output, exit) = collect(&mut events).await;
        assert!(String::from_utf8_lossy(&output).contains("got:ping"));
        assert_eq!(exit, Some(Some(0)));
    }

    #[tokio::test]
    async fn master_is_not_inherited_across_exec() {
        let (proc, mut events) = ShellProcess::spawn(&sh("exit 0"), 80, 24).unwrap();
        let fd = proc.master.inner.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
        let status = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(status & libc::O_NONBLOCK != 0);
        assert_eq!(collect(&mut events).await.1, Some(Some(0)));
    }

    #[tokio::test]
    async fn terminate_kills_without_exit_event() {
        let (proc, mut events) = ShellProcess::spawn(&sh("exec sleep 30"), 80, 24).unwrap();
        let pid = proc.pid().unwrap() as i32;

        proc.terminate().await;

        assert!(is_gone(pid));
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            assert!(!matches!(event, ShellEvent::Exited(_)));
        }
    }

    #[tokio::test]
    async fn input_to_a_shell_that_never_reads_does_not_block() {
        let (proc, _events) = ShellProcess::spawn(&sh("exec sleep 30"), 80, 24).unwrap();
        let pid = proc.pid().unwrap() as i32;
        let chunk = Bytes::from("echo x\n".repeat(64 * 1024 / 7));

        let writes = async {
            let mut refused = false;
            for _ in 0..(INPUT_QUEUE + 8) {
                if let Err(e) = proc.write(chunk.clone()) {
                    assert_eq!(e.kind(), io::ErrorKind::WouldBlock);
                    refused = true;
                }
            }
            refused
        };
        let refused = tokio::time::timeout(Duration::from_secs(1), writes).await.unwrap();
        assert!(refused);

        tokio::time::timeout(Duration::from_secs(8), proc.terminate())
            .await
            .unwrap();
        assert!(is_gone(pid));
    }
}
