use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::time::{Duration, Instant};

pub fn get_command_str(cmd: &Command) -> String {
    let prog = cmd.get_program().to_string_lossy();
    let args = cmd.get_args().map(|x| x.to_string_lossy());
    std::iter::once(prog).chain(args).collect::<Vec<_>>().join(" ")
}

/// How a child started by [`run_with_timeout`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Exited(i32),
    Signaled(i32),
    /// The child outlived its deadline and was killed.
    TimedOut,
}

impl Outcome {
    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, Outcome::Exited(0))
    }
}

/// Runs `cmd` with stdout and stderr redirected into the given files and
/// kills it once `timeout` has elapsed.
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    stdout: &Path,
    stderr: &Path,
) -> anyhow::Result<Outcome> {
    let cmd_str = get_command_str(&cmd);
    log::debug!("command: {}", cmd_str);

    use std::os::unix::process::ExitStatusExt; // for status.signal()
    cmd.stdin(Stdio::null())
        .stdout(std::fs::File::create(stdout)?)
        .stderr(std::fs::File::create(stderr)?);
    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn {}: {}", cmd_str, e))?;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            let outcome = match status.code() {
                Some(code) => Outcome::Exited(code),
                None => Outcome::Signaled(status.signal().unwrap_or_default()),
            };
            if !outcome.success() {
                log::debug!("{:?}, cmd: {}", outcome, cmd_str);
            }
            return Ok(outcome);
        }

        if Instant::now() >= deadline {
            log::warn!("killing the child process after {:?}: {}", timeout, cmd_str);
            child.kill()?;
            child.wait()?;
            return Ok(Outcome::TimedOut);
        }

        log::trace!("status not ready yet, sleep for 5 ms");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Waits for the child spawned from `cmd`, killing it once `stop_flag` is raised.
pub fn poll_cmd(mut cmd: Command, stop_flag: &AtomicBool) -> anyhow::Result<()> {
    let cmd_str = get_command_str(&cmd);
    log::debug!("command: {}", cmd_str);

    use std::os::unix::process::ExitStatusExt; // for status.signal()
    let mut child = cmd.spawn()?;
    loop {
        if let Some(status) = child.try_wait()? {
            if !status.success() {
                match status.code() {
                    Some(code) => log::error!("Exited with code: {}, cmd: {}", code, cmd_str),
                    None => log::error!(
                        "Process terminated by signal: {:?}, cmd: {}",
                        status.signal(),
                        cmd_str,
                    ),
                }
            }
            return Ok(());
        }

        // check if kill is needed
        if stop_flag.load(SeqCst) {
            log::warn!("killing the child process: {}", cmd_str);
            child.kill()?;
            child.wait()?;
            log::warn!("child process terminated");
            return Ok(());
        }

        std::thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_output_into_files() {
        let dir = tempfile::tempdir().unwrap();
        let (out, err) = (dir.path().join("out"), dir.path().join("err"));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; echo oops >&2; exit 3");

        let outcome = run_with_timeout(cmd, Duration::from_secs(10), &out, &err).unwrap();
        assert_eq!(outcome, Outcome::Exited(3));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
        assert_eq!(std::fs::read_to_string(&err).unwrap(), "oops\n");
    }

    #[test]
    fn kills_after_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = Command::new("sleep");
        cmd.arg("10");

        let start = Instant::now();
        let outcome = run_with_timeout(
            cmd,
            Duration::from_millis(200),
            &dir.path().join("out"),
            &dir.path().join("err"),
        )
        .unwrap();
        assert_eq!(outcome, Outcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_program_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = Command::new("/nonexistent/compiler");
        assert!(run_with_timeout(
            cmd,
            Duration::from_secs(1),
            &dir.path().join("out"),
            &dir.path().join("err"),
        )
        .is_err());
    }

    #[test]
    fn poll_cmd_honors_stop_flag() {
        let stop = AtomicBool::new(true);
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let start = Instant::now();
        poll_cmd(cmd, &stop).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn command_str() {
        let mut cmd = Command::new("rustc");
        cmd.arg("-O").arg("main.rs");
        assert_eq!(get_command_str(&cmd), "rustc -O main.rs");
    }
}
