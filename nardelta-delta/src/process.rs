//! Subprocess plumbing for the delta tools: stdin/stdout streaming, the
//! `/dev/fd/3` base pipe, stderr capture and child resource accounting.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::time::Instant;

use nix::fcntl::OFlag;
use nix::sys::resource::{getrusage, UsageWho};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::Command;

use crate::Input;

/// Fd number the base pipe is installed at in the child.
const BASE_FD: i32 = 3;

const STDERR_EXCERPT: usize = 800;

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("{tool}: {source}")]
    Io {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status} [stderr: {stderr:?}]")]
    NonZeroExit {
        tool: &'static str,
        status: String,
        stderr: String,
    },
}

pub(crate) struct RunOutcome {
    pub bytes_out: u64,
    pub wall_ms: u64,
    pub user_ms: u64,
    pub sys_ms: u64,
}

/// Run one delta tool to completion: base on `/dev/fd/3` (or a plain file
/// path), `stdin_src` on stdin, stdout streamed into `output`, stderr
/// captured for diagnostics.
pub(crate) async fn run_tool(
    tool: &'static str,
    argv: impl FnOnce(&str) -> Vec<String>,
    base: Input<'_>,
    stdin_src: Input<'_>,
    output: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<RunOutcome, DeltaError> {
    let io_err = |source| DeltaError::Io { tool, source };
    let os_err = |e: nix::errno::Errno| DeltaError::Io {
        tool,
        source: io::Error::from_raw_os_error(e as i32),
    };

    // base: either a path argument or a pipe inherited at BASE_FD
    let mut base_read_fd: Option<OwnedFd> = None;
    let mut base_feed: Option<(pipe::Sender, &mut (dyn AsyncRead + Send + Unpin))> = None;
    let base_arg = match base {
        Input::File(path) => path.display().to_string(),
        Input::Stream(src) => {
            let (r, w) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(os_err)?;
            base_feed = Some((pipe::Sender::from_owned_fd(w).map_err(io_err)?, src));
            base_read_fd = Some(r);
            format!("/dev/fd/{BASE_FD}")
        }
    };

    let mut cmd = Command::new(tool);
    cmd.args(argv(&base_arg));
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut stdin_feed: Option<&mut (dyn AsyncRead + Send + Unpin)> = None;
    match stdin_src {
        Input::File(path) => {
            let f = std::fs::File::open(path).map_err(io_err)?;
            cmd.stdin(Stdio::from(f));
        }
        Input::Stream(src) => {
            cmd.stdin(Stdio::piped());
            stdin_feed = Some(src);
        }
    }

    if let Some(fd) = &base_read_fd {
        let raw = fd.as_raw_fd();
        // make the read end visible to the child at BASE_FD; both pipe
        // ends carry CLOEXEC so nothing else leaks through the exec
        unsafe {
            cmd.pre_exec(move || {
                // async-signal-safe: raw dup2/fcntl only
                let res = if raw == BASE_FD {
                    nix::libc::fcntl(BASE_FD, nix::libc::F_SETFD, 0)
                } else {
                    nix::libc::dup2(raw, BASE_FD)
                };
                if res < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let usage_before = getrusage(UsageWho::RUSAGE_CHILDREN).map_err(os_err)?;
    let start = Instant::now();

    let mut child = cmd.spawn().map_err(io_err)?;
    drop(base_read_fd); // the child holds its own copy now

    let mut stdout = child.stdout.take().expect("stdout is piped");
    let mut stderr = child.stderr.take().expect("stderr is piped");
    let stdin = child.stdin.take();

    let out_fut = async { tokio::io::copy(&mut stdout, output).await };
    let err_fut = async {
        let mut text = String::new();
        let _ = stderr.read_to_string(&mut text).await;
        text
    };
    let stdin_fut = async {
        if let (Some(mut w), Some(src)) = (stdin, stdin_feed) {
            tokio::io::copy(src, &mut w).await?;
            w.shutdown().await?;
        }
        Ok::<_, io::Error>(())
    };
    let base_fut = async {
        if let Some((mut sender, src)) = base_feed {
            tokio::io::copy(src, &mut sender).await?;
            sender.shutdown().await?;
        }
        Ok::<_, io::Error>(())
    };

    let (out_res, stderr_text, stdin_res, base_res, status) =
        tokio::join!(out_fut, err_fut, stdin_fut, base_fut, child.wait());

    let status = status.map_err(io_err)?;
    let usage_after = getrusage(UsageWho::RUSAGE_CHILDREN).map_err(os_err)?;

    if !status.success() {
        let mut stderr = stderr_text;
        stderr.truncate(STDERR_EXCERPT);
        return Err(DeltaError::NonZeroExit {
            tool,
            status: status.to_string(),
            stderr,
        });
    }
    stdin_res.map_err(io_err)?;
    base_res.map_err(io_err)?;
    let bytes_out = out_res.map_err(io_err)?;

    Ok(RunOutcome {
        bytes_out,
        wall_ms: start.elapsed().as_millis() as u64,
        user_ms: timeval_delta_ms(usage_after.user_time(), usage_before.user_time()),
        sys_ms: timeval_delta_ms(usage_after.system_time(), usage_before.system_time()),
    })
}

/// Buffer a stream into a named temp file so a tool that needs a seekable
/// base can work on it.
pub(crate) async fn spool_to_temp(
    tool: &'static str,
    src: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<tempfile::NamedTempFile, DeltaError> {
    let io_err = |source| DeltaError::Io { tool, source };
    let temp = tempfile::NamedTempFile::new().map_err(io_err)?;
    let mut file = tokio::fs::File::create(temp.path()).await.map_err(io_err)?;
    tokio::io::copy(src, &mut file).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(temp)
}

fn timeval_delta_ms(after: nix::sys::time::TimeVal, before: nix::sys::time::TimeVal) -> u64 {
    let after_us = after.tv_sec() * 1_000_000 + after.tv_usec();
    let before_us = before.tv_sec() * 1_000_000 + before.tv_usec();
    after_us.saturating_sub(before_us).max(0) as u64 / 1000
}
