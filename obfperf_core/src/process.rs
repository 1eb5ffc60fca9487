use std::ffi::OsStr;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounds how late an exit is noticed, and with it the error of `elapsed`.
const MIN_POLL_INTERVAL: Duration = Duration::from_micros(50);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Exited(i32),
    Signaled(i32),
    Timeout,
    Other(String),
}

impl ExecutionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionStatus::Ok)
    }
}

pub struct CommandExecutorConfig {
    /// Program followed by its leading arguments.
    pub command: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

/// Runs one external program to completion, or kills it once its timeout
/// expires. Stdout and stderr are captured.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Host wall time from spawn until the exit was observed.
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct Execution {
    pub status: ExecutionStatus,
    pub output: ProcessOutput,
}

impl Execution {
    fn failed_before_start(message: String) -> Self {
        Self {
            status: ExecutionStatus::Other(message),
            output: ProcessOutput::default(),
        }
    }
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    /// Spawns the configured command with `extra_args` appended and blocks
    /// until it exits or times out.
    pub fn execute_sync<S: AsRef<OsStr>>(&self, extra_args: &[S]) -> Execution {
        let Some((program, leading_args)) = self.config.command.split_first() else {
            return Execution::failed_before_start("Empty command".to_string());
        };

        let mut cmd = Command::new(program);
        cmd.args(leading_args);
        cmd.args(extra_args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Own process group, so a timeout can take down grandchildren too
        // (the wrapper forks the measured binary).
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setpgid is async-signal-safe and touches no parent state.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let start_time = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error_msg =
                    format!("Failed to spawn command '{:?}': {}", self.config.command, e);
                debug!("{error_msg}");
                return Execution::failed_before_start(error_msg);
            }
        };

        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let wait_result = self.run_and_wait_with_timeout(&mut child, start_time);
        let elapsed = start_time.elapsed();

        let status = match wait_result {
            Ok(exit_status) => status_from_exit(exit_status),
            // The readers may still hold pipes shared with stray descendants;
            // they are left to finish on their own.
            Err(status) => {
                return Execution {
                    status,
                    output: ProcessOutput {
                        elapsed,
                        ..ProcessOutput::default()
                    },
                };
            }
        };

        Execution {
            status,
            output: ProcessOutput {
                stdout: join_pipe_reader(stdout_reader),
                stderr: join_pipe_reader(stderr_reader),
                elapsed,
            },
        }
    }

    fn run_and_wait_with_timeout(
        &self,
        child: &mut Child,
        start_time: Instant,
    ) -> Result<ExitStatus, ExecutionStatus> {
        let timeout = self.config.timeout;
        let mut poll_interval = MIN_POLL_INTERVAL;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        warn!(
                            "'{}' timed out after {timeout:?}, killing",
                            self.config.command[0]
                        );
                        kill_process_tree(child);
                        return Err(ExecutionStatus::Timeout);
                    }
                    std::thread::sleep(poll_interval);
                    poll_interval = (poll_interval * 2).min(MAX_POLL_INTERVAL);
                }
                Err(e) => {
                    kill_process_tree(child);
                    return Err(ExecutionStatus::Other(format!(
                        "Error waiting for child: {e}"
                    )));
                }
            }
        }
    }
}

fn status_from_exit(status: ExitStatus) -> ExecutionStatus {
    if status.success() {
        return ExecutionStatus::Ok;
    }
    if let Some(code) = status.code() {
        return ExecutionStatus::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExecutionStatus::Signaled(signal);
        }
    }
    ExecutionStatus::Other("Exited abnormally".to_string())
}

fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = i32::try_from(child.id()) {
            // SAFETY: plain syscall on the group created in pre_exec.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    if let Err(e) = child.kill() {
        debug!("Failed to kill child process: {e}");
    }
    let _ = child.wait();
}

fn spawn_pipe_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_pipe_reader(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Last `max_chars` characters of captured output, lossily decoded.
pub fn output_tail(bytes: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    let skip = text.chars().count().saturating_sub(max_chars);
    text.chars().skip(skip).collect()
}
