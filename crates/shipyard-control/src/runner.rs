use std::{
    collections::{BTreeMap, VecDeque},
    path::Path,
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::broker::LogSink;
use crate::error::{DeployError, DeployResult};

const TAIL_LINES: usize = 40;
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// A shell command to run inside a workspace.
#[derive(Debug, Clone)]
pub struct ShellCommand<'a> {
    pub command: &'a str,
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Last lines of combined output.
    pub tail: String,
}

struct Tail {
    lines: VecDeque<String>,
}

impl Tail {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn into_text(self) -> String {
        self.lines.into_iter().collect::<Vec<_>>().join("\n")
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                // Best-effort UTF-8: build tools occasionally emit raw bytes.
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Run `sh -c <command>`, streaming each output line to `sink` as it arrives.
///
/// Returns the exit status and an output tail. Does not treat a non-zero exit as
/// an error; see [`run_checked`].
pub async fn run(cmd: &ShellCommand<'_>, sink: &LogSink) -> DeployResult<CommandOutput> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd.command)
        .current_dir(cmd.cwd)
        .envs(cmd.env);
    run_streaming(command, cmd.command, cmd.timeout, sink).await
}

/// Run a program directly (no shell), for arguments that must not be re-parsed.
pub async fn run_program(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
    sink: &LogSink,
) -> DeployResult<CommandOutput> {
    let mut command = Command::new(program);
    command.args(args).current_dir(cwd);
    let label = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    let out = run_streaming(command, &label, timeout, sink).await?;
    if !out.success {
        return Err(DeployError::Command {
            command: label,
            exit_code: out.exit_code,
            output_tail: out.tail,
        });
    }
    Ok(out)
}

async fn run_streaming(
    mut command: Command,
    label: &str,
    timeout: Duration,
    sink: &LogSink,
) -> DeployResult<CommandOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|e| {
        DeployError::Io(std::io::Error::new(e.kind(), format!("spawn `{label}`: {e}")))
    })?;
    let pid = child.id();
    tracing::debug!(job_id = %sink.job_id(), command = label, pid = ?pid, "command started");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if let Some(out) = child.stdout.take() {
        tokio::spawn(forward_lines(out, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(forward_lines(err, tx.clone()));
    }
    drop(tx);

    let pump_sink = sink.clone();
    let mut pump = tokio::spawn(async move {
        let mut tail = Tail::new();
        while let Some(line) = rx.recv().await {
            pump_sink.line(&line);
            tail.push(line);
        }
        tail
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            kill_process_group(pid);
            let _ = child.kill().await;
            pump.abort();
            return Err(DeployError::Timeout {
                command: label.to_string(),
                after: timeout,
            });
        }
    };

    // Detached grandchildren can keep the pipes open; don't wait on them forever.
    let tail = match tokio::time::timeout(DRAIN_GRACE, &mut pump).await {
        Ok(Ok(tail)) => tail.into_text(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            pump.abort();
            tracing::warn!(command = label, "output still open after exit; detaching");
            String::new()
        }
    };

    Ok(CommandOutput {
        exit_code: status.code(),
        success: status.success(),
        tail,
    })
}

/// Like [`run`], but a non-zero exit becomes [`DeployError::Command`].
pub async fn run_checked(cmd: &ShellCommand<'_>, sink: &LogSink) -> DeployResult<CommandOutput> {
    let out = run(cmd, sink).await?;
    if !out.success {
        return Err(DeployError::Command {
            command: cmd.command.to_string(),
            exit_code: out.exit_code,
            output_tail: out.tail,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LogBroker;
    use shipyard_job::JobId;

    fn shell<'a>(
        command: &'a str,
        cwd: &'a Path,
        env: &'a BTreeMap<String, String>,
    ) -> ShellCommand<'a> {
        ShellCommand {
            command,
            cwd,
            env,
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn streams_stdout_and_stderr_into_the_job_log() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LogBroker::new();
        let job = JobId(1);
        broker.open(job);
        let env = BTreeMap::new();

        let out = run(&shell("echo out; echo err 1>&2", dir.path(), &env), &broker.sink(job))
            .await
            .unwrap();
        assert!(out.success);

        let logs = broker.snapshot(job).unwrap();
        assert!(logs.contains("out\n"));
        assert!(logs.contains("err\n"));
    }

    #[tokio::test]
    async fn env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let broker = LogBroker::new();
        let job = JobId(2);
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());

        run_checked(
            &shell("cat marker.txt; echo; echo $GREETING", dir.path(), &env),
            &broker.sink(job),
        )
        .await
        .unwrap();

        let logs = broker.snapshot(job).unwrap();
        assert!(logs.contains("here"));
        assert!(logs.contains("hello"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_command_error_with_tail() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LogBroker::new();
        let env = BTreeMap::new();

        let err = run_checked(
            &shell("echo partial; exit 3", dir.path(), &env),
            &broker.sink(JobId(3)),
        )
        .await
        .unwrap_err();

        match err {
            DeployError::Command {
                exit_code,
                output_tail,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(output_tail.contains("partial"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LogBroker::new();
        let env = BTreeMap::new();
        let cmd = ShellCommand {
            command: "sleep 30",
            cwd: dir.path(),
            env: &env,
            timeout: Duration::from_millis(200),
        };

        let err = run(&cmd, &broker.sink(JobId(4))).await.unwrap_err();
        assert!(matches!(err, DeployError::Timeout { .. }));
    }
}
