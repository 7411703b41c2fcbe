use crate::config::BuildConfig;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use utils::cmd_helper::{self, Outcome};

/// One compiler invocation inside a session directory.
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub session_dir: PathBuf,
    pub language: String,
    pub options: Vec<String>,
    /// File names relative to `session_dir`.
    pub sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub outcome: Outcome,
}

impl CompileOutput {
    /// Clean means the tool finished in time and never mentioned an error.
    pub fn is_clean(&self) -> bool {
        self.outcome != Outcome::TimedOut
            && !contains_error(&self.stdout)
            && !contains_error(&self.stderr)
    }
}

fn contains_error(text: &str) -> bool {
    text.to_lowercase().contains("error")
}

/// Runs the build tool. `Err` means the tool could not be run at all.
pub trait Compiler {
    fn compile(&self, job: &CompileJob) -> anyhow::Result<CompileOutput>;
}

/// Invokes a real compiler as a child process with a wall-clock bound.
pub struct ExternalCompiler {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalCompiler {
    pub fn new(config: &BuildConfig) -> Self {
        ExternalCompiler {
            program: config.compiler.clone(),
            args: config.compiler_args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl Compiler for ExternalCompiler {
    fn compile(&self, job: &CompileJob) -> anyhow::Result<CompileOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&job.session_dir)
            .args(&self.args)
            .args(&job.options)
            .args(&job.sources);
        let command = cmd_helper::get_command_str(&cmd);

        let stem = capture_stem(&job.sources);
        let stdout_path = job.session_dir.join(format!("{}.stdout", stem));
        let stderr_path = job.session_dir.join(format!("{}.stderr", stem));
        let outcome = cmd_helper::run_with_timeout(cmd, self.timeout, &stdout_path, &stderr_path)?;

        let output = CompileOutput {
            command,
            stdout: read_capture(&stdout_path),
            stderr: read_capture(&stderr_path),
            outcome,
        };
        let _ = std::fs::remove_file(&stdout_path);
        let _ = std::fs::remove_file(&stderr_path);
        Ok(output)
    }
}

fn capture_stem(sources: &[String]) -> String {
    let first = sources
        .first()
        .and_then(|s| Path::new(s).file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "build".to_owned());
    format!(".compile_{}", first)
}

fn read_capture(path: &Path) -> String {
    std::fs::read(path)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}
