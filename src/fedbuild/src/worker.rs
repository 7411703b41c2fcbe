//! The build worker.
//!
//! A worker carries at most one [`BuildSession`] at a time:
//!
//! ```text
//! Idle -BUILDREQUEST-> AwaitingFiles -FILEREQUESTCOMPLETE-> (verify, compile, log)
//!      -> ForwardingToTest -TESTFILEREQUEST-> Idle
//! ```
//!
//! Every way out of a session ends with `READY` to the dispatcher, so a failed
//! session never strands the worker.
use crate::command::{self, arg};
use crate::compiler::{CompileJob, CompileOutput, Compiler};
use crate::request::{self, BuildRequest};
use crate::runtime::{client_of, notify, Handler};
use litemsg::{FileTransferArgs, Message, Node, Outbox};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Addresses and storage a worker needs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub base_dir: PathBuf,
    pub dispatcher: Node,
    pub repository: Node,
    pub test_node: Node,
    pub artifact_extensions: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("request file {0} is missing or malformed")]
    BadRequest(String),
    #[error("request {0} names no files")]
    NothingToBuild(String),
    #[error("missing files: {}", .0.join(", "))]
    MissingFiles(Vec<String>),
    #[error("cannot prepare session directory: {0}")]
    Storage(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct BuildSession {
    pub id: String,
    pub client: Node,
    /// file name of the request, a copy lives in `dir`
    pub project: String,
    pub request: BuildRequest,
    pub dir: PathBuf,
    /// file names that must be present before compiling
    pub outstanding: BTreeSet<String>,
}

impl BuildSession {
    fn verify(&self) -> Result<(), SessionError> {
        let missing: Vec<String> = self
            .outstanding
            .iter()
            .filter(|f| !self.dir.join(f).is_file())
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SessionError::MissingFiles(missing))
        }
    }
}

enum State {
    Idle,
    AwaitingFiles(BuildSession),
    ForwardingToTest {
        session: BuildSession,
        artifacts: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingFiles,
    ForwardingToTest,
}

struct BuildResult {
    outputs: Vec<CompileOutput>,
    clean: bool,
    artifacts: Vec<PathBuf>,
}

pub struct Worker<C> {
    settings: WorkerSettings,
    compiler: C,
    state: State,
}

/// `<utc time>_<random>`, unique enough across a federation.
pub fn new_session_id() -> String {
    format!(
        "{}_{:08x}",
        chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
        rand::random::<u32>()
    )
}

impl<C: Compiler> Worker<C> {
    pub fn new(settings: WorkerSettings, compiler: C) -> Self {
        Worker {
            settings,
            compiler,
            state: State::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::Idle => Phase::Idle,
            State::AwaitingFiles(_) => Phase::AwaitingFiles,
            State::ForwardingToTest { .. } => Phase::ForwardingToTest,
        }
    }

    #[inline]
    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.state {
            State::Idle => None,
            State::AwaitingFiles(s) | State::ForwardingToTest { session: s, .. } => Some(&s.id),
        }
    }

    /// Registers with the dispatcher as idle.
    pub fn announce_ready(&self, out: &dyn Outbox) {
        out.post(Message::request(
            command::READY,
            self.settings.dispatcher.clone(),
        ));
    }

    fn finish(&mut self, out: &dyn Outbox) {
        self.state = State::Idle;
        log::debug!("worker {} is idle again", out.local());
        self.announce_ready(out);
    }

    fn on_build_request(&mut self, out: &dyn Outbox, msg: &Message) -> anyhow::Result<()> {
        let client = client_of(msg);
        let project = msg.arg(arg::PROJECT).unwrap_or_default().to_owned();

        if let Some(busy) = self.session_id() {
            log::warn!("request {} arrived during session {}, dropped", project, busy);
            notify(
                out,
                &client,
                format!("worker {} is busy, request {} dropped", out.local(), project),
            );
            return Ok(());
        }

        let session = match self.open_session(&project, client.clone()) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("rejecting build request {}: {}", project, e);
                notify(out, &client, format!("build request {} rejected: {}", project, e));
                self.finish(out);
                return Ok(());
            }
        };

        let files: Vec<String> = session.request.all_files().into_iter().collect();
        let mut fetch = Message::request(command::FILEREQUEST, self.settings.repository.clone())
            .with_arg(arg::SESSIONID, &session.id);
        fetch.set_list(arg::FILECOUNT, arg::FILE, &files);
        out.post(fetch);

        notify(
            out,
            &client,
            format!(
                "worker {} accepted {} as session {}, fetching {} files",
                out.local(),
                project,
                session.id,
                files.len()
            ),
        );
        self.state = State::AwaitingFiles(session);
        Ok(())
    }

    fn open_session(&self, project: &str, client: Node) -> Result<BuildSession, SessionError> {
        let project = request::file_name(project);
        let request_path = self.settings.base_dir.join(&project);
        let request = BuildRequest::parse(&request_path)
            .ok_or_else(|| SessionError::BadRequest(project.clone()))?;
        let outstanding: BTreeSet<String> = request
            .all_files()
            .iter()
            .map(|f| request::file_name(f))
            .collect();
        if outstanding.is_empty() {
            return Err(SessionError::NothingToBuild(project));
        }

        let id = new_session_id();
        let dir = self.settings.base_dir.join(&id);
        std::fs::create_dir_all(&dir)?;
        std::fs::copy(&request_path, dir.join(&project))?;

        Ok(BuildSession {
            id,
            client,
            project,
            request,
            dir,
            outstanding,
        })
    }

    fn on_files_complete(&mut self, out: &dyn Outbox, msg: &Message) -> anyhow::Result<()> {
        let sid = msg.arg(arg::SESSIONID);
        let session = match std::mem::replace(&mut self.state, State::Idle) {
            State::AwaitingFiles(s) if Some(s.id.as_str()) == sid => s,
            other => {
                self.state = other;
                log::warn!("unexpected {} for session {:?}", msg.command, sid);
                return Ok(());
            }
        };
        log::info!(
            "session {}: repository streamed {} files",
            session.id,
            msg.arg_usize(arg::FILECOUNT).unwrap_or(0)
        );

        if let Err(e) = session.verify() {
            notify(
                out,
                &session.client,
                format!("session {}: build aborted, {}", session.id, e),
            );
            self.finish(out);
            return Ok(());
        }

        notify(
            out,
            &session.client,
            format!("session {}: build started", session.id),
        );
        let result = match self.build(&session) {
            Ok(r) => r,
            Err(e) => {
                log::error!("session {}: compiler invocation failed: {:?}", session.id, e);
                notify(
                    out,
                    &session.client,
                    format!("session {}: build failed due to exception: {}", session.id, e),
                );
                self.finish(out);
                return Ok(());
            }
        };

        let verdict = if result.clean { "succeeded" } else { "failed" };
        match self.ship_build_log(out, &session, &result) {
            Ok(name) => notify(
                out,
                &session.client,
                format!("session {}: build {}, log archived as {}", session.id, verdict, name),
            ),
            Err(e) => {
                log::warn!("session {}: build log not archived: {}", session.id, e);
                notify(
                    out,
                    &session.client,
                    format!("session {}: build {}, log not archived", session.id, verdict),
                );
            }
        }

        if !result.clean {
            self.finish(out);
        } else if result.artifacts.is_empty() {
            notify(
                out,
                &session.client,
                format!("session {}: no test artifacts produced", session.id),
            );
            self.finish(out);
        } else {
            self.forward_to_test(out, session, result.artifacts);
        }
        Ok(())
    }

    fn build(&self, session: &BuildSession) -> anyhow::Result<BuildResult> {
        let before: BTreeSet<String> = utils::fs::list_dir(&session.dir)?.1.into_iter().collect();

        let mut outputs = Vec::new();
        for sources in session.request.compile_units() {
            let job = CompileJob {
                session_dir: session.dir.clone(),
                language: session.request.language.clone(),
                options: session.request.options(),
                sources,
            };
            let output = self.compiler.compile(&job)?;
            log::debug!("{} -> {:?}", output.command, output.outcome);
            outputs.push(output);
        }

        let (_, after) = utils::fs::list_dir(&session.dir)?;
        let artifacts = after
            .into_iter()
            .filter(|f| !before.contains(f))
            .map(|f| session.dir.join(f))
            .filter(|p| is_artifact(p, &self.settings.artifact_extensions))
            .collect();

        Ok(BuildResult {
            clean: outputs.iter().all(CompileOutput::is_clean),
            outputs,
            artifacts,
        })
    }

    /// Writes the build log into the session directory and uploads it to the repository.
    fn ship_build_log(
        &self,
        out: &dyn Outbox,
        session: &BuildSession,
        result: &BuildResult,
    ) -> anyhow::Result<String> {
        let stem = Path::new(&session.project)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = format!(
            "BuildLog_{}_{}_{}.txt",
            stem,
            out.local().port,
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );

        let mut text = String::new();
        writeln!(text, "session: {}", session.id)?;
        writeln!(text, "request: {}", session.project)?;
        writeln!(text, "language: {}", session.request.language)?;
        writeln!(text, "compiler options: {}", session.request.compiler_options)?;
        for output in &result.outputs {
            writeln!(text, "\n$ {}", output.command)?;
            writeln!(text, "{:?}", output.outcome)?;
            writeln!(text, "--- stdout\n{}", output.stdout)?;
            writeln!(text, "--- stderr\n{}", output.stderr)?;
        }
        writeln!(
            text,
            "\nresult: {}",
            if result.clean { "succeeded" } else { "failed" }
        )?;
        for artifact in &result.artifacts {
            writeln!(text, "artifact: {}", artifact.display())?;
        }

        let path = session.dir.join(&name);
        std::fs::write(&path, text)?;
        out.post_file(
            &path,
            &self.settings.repository,
            Some(FileTransferArgs::for_session(&session.id)),
        )?;
        Ok(name)
    }

    fn forward_to_test(&mut self, out: &dyn Outbox, session: BuildSession, artifacts: Vec<PathBuf>) {
        // the test node gets the request first, the artifacts once it asks for them
        let request_copy = session.dir.join(&session.project);
        if let Err(e) = out.post_file(
            &request_copy,
            &self.settings.test_node,
            Some(FileTransferArgs::for_session(&session.id)),
        ) {
            log::warn!("session {}: test node unreachable: {}", session.id, e);
            notify(
                out,
                &session.client,
                format!("session {}: test node unreachable, tests skipped", session.id),
            );
            self.finish(out);
            return;
        }

        out.post(
            Message::request(command::EXECTESTCASES, self.settings.test_node.clone())
                .with_arg(arg::SESSIONID, &session.id)
                .with_arg(arg::CLIENTDETAILS, &session.client)
                .with_arg(arg::PROJECT, &session.project),
        );
        notify(
            out,
            &session.client,
            format!(
                "session {}: forwarding {} artifacts to the test node",
                session.id,
                artifacts.len()
            ),
        );
        self.state = State::ForwardingToTest { session, artifacts };
    }

    fn on_test_file_request(&mut self, out: &dyn Outbox, msg: &Message) -> anyhow::Result<()> {
        let sid = msg.arg(arg::SESSIONID);
        let (session, artifacts) = match std::mem::replace(&mut self.state, State::Idle) {
            State::ForwardingToTest { session, artifacts } if Some(session.id.as_str()) == sid => {
                (session, artifacts)
            }
            other => {
                self.state = other;
                log::warn!("unexpected {} for session {:?}", msg.command, sid);
                return Ok(());
            }
        };

        let mut uploaded = Vec::new();
        for path in &artifacts {
            match out.post_file(
                path,
                &self.settings.test_node,
                Some(FileTransferArgs::for_session(&session.id)),
            ) {
                Ok(()) => uploaded.push(request::file_name(&path.to_string_lossy())),
                Err(e) => log::warn!("session {}: upload of {} failed: {}", session.id, path.display(), e),
            }
        }

        let mut manifest = Message::request(command::TESTFILEREQUEST, self.settings.test_node.clone())
            .with_arg(arg::SESSIONID, &session.id)
            .with_arg(arg::CLIENTDETAILS, &session.client)
            .with_arg(arg::PROJECT, &session.project);
        manifest.set_list(arg::FILECOUNT, arg::FILE, &uploaded);
        out.post(manifest);

        notify(
            out,
            &session.client,
            format!(
                "session {}: {} of {} artifacts sent to the test node",
                session.id,
                uploaded.len(),
                artifacts.len()
            ),
        );
        self.finish(out);
        Ok(())
    }
}

impl<C: Compiler> Handler for Worker<C> {
    fn handle(&mut self, out: &dyn Outbox, msg: Message) -> anyhow::Result<()> {
        match msg.command.as_str() {
            command::BUILDREQUEST => self.on_build_request(out, &msg),
            command::FILEREQUESTCOMPLETE => self.on_files_complete(out, &msg),
            command::TESTFILEREQUEST => self.on_test_file_request(out, &msg),
            other => {
                log::warn!("worker ignores command {:?} from {}", other, msg.from);
                Ok(())
            }
        }
    }

    fn on_shutdown(&mut self, _out: &dyn Outbox) {
        if let Some(id) = self.session_id() {
            log::warn!("shutting down in the middle of session {}", id);
        }
    }
}

fn is_artifact(path: &Path, extensions: &[String]) -> bool {
    use std::os::unix::fs::PermissionsExt;
    let by_ext = path
        .extension()
        .map(|e| extensions.iter().any(|x| x.trim_start_matches('.') == e))
        .unwrap_or(false);
    let executable = std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    by_ext || executable
}
