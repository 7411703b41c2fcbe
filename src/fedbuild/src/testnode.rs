use crate::command::{self, arg};
use crate::harness::{self, Report, Verdict};
use crate::request::{self, BuildRequest};
use crate::runtime::{client_of, notify, Handler};
use crate::session_dir;
use litemsg::{FileTransferArgs, Message, Node, Outbox};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use utils::cmd_helper::{self, Outcome};

pub struct TestNode {
    base_dir: PathBuf,
    repository: Node,
    timeout: Duration,
    /// client of every session that asked for a test run
    sessions: HashMap<String, Node>,
}

impl TestNode {
    pub fn new(base_dir: PathBuf, repository: Node, timeout: Duration) -> Self {
        TestNode {
            base_dir,
            repository,
            timeout,
            sessions: HashMap::new(),
        }
    }

    fn on_exec(&mut self, out: &dyn Outbox, msg: &Message) -> anyhow::Result<()> {
        let session = msg
            .arg(arg::SESSIONID)
            .ok_or_else(|| anyhow::anyhow!("{} without {}", msg.command, arg::SESSIONID))?;
        let dir = session_dir(&self.base_dir, session)
            .ok_or_else(|| anyhow::anyhow!("invalid session id {:?}", session))?;
        std::fs::create_dir_all(&dir)?;

        let client = client_of(msg);
        self.sessions.insert(session.to_owned(), client.clone());
        out.post(
            Message::reply(command::TESTFILEREQUEST, msg.from.clone())
                .with_arg(arg::SESSIONID, session)
                .with_auto_disconnect(),
        );
        notify(
            out,
            &client,
            format!("session {}: test node is waiting for artifacts", session),
        );
        Ok(())
    }

    fn on_manifest(&mut self, out: &dyn Outbox, msg: &Message) -> anyhow::Result<()> {
        let session = msg
            .arg(arg::SESSIONID)
            .ok_or_else(|| anyhow::anyhow!("{} without {}", msg.command, arg::SESSIONID))?;
        let dir = session_dir(&self.base_dir, session)
            .ok_or_else(|| anyhow::anyhow!("invalid session id {:?}", session))?;
        let client = self
            .sessions
            .remove(session)
            .unwrap_or_else(|| client_of(msg));
        let artifacts = msg.list(arg::FILECOUNT, arg::FILE);
        notify(
            out,
            &client,
            format!("session {}: received {} test artifacts", session, artifacts.len()),
        );

        let mut body = String::new();
        writeln!(body, "session: {}", session)?;
        if let Some(project) = msg.arg(arg::PROJECT) {
            let requested_by = BuildRequest::parse(dir.join(request::file_name(project)))
                .map(|r| r.client_id)
                .unwrap_or_default();
            writeln!(body, "request: {} {}", project, requested_by)?;
        }

        let mut reports = Vec::new();
        for artifact in &artifacts {
            let name = request::file_name(artifact);
            let (outcome, found) = self.run_artifact(&dir, &name);
            writeln!(body, "\nartifact: {} ({:?})", name, outcome)?;
            for r in &found {
                writeln!(body, "{}", r)?;
            }
            reports.extend(found);
        }

        let passed = reports.iter().filter(|r| r.verdict == Verdict::Pass).count();
        let failed = reports.len() - passed;
        writeln!(body, "\nsummary: {} passed, {} failed", passed, failed)?;

        let log_name = format!(
            "TestLog_{}_{}.txt",
            session,
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        let log_path = dir.join(&log_name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(&log_path, body)?;

        let archived = out.post_file(
            &log_path,
            &self.repository,
            Some(FileTransferArgs::for_session(session)),
        );
        let text = match archived {
            Ok(()) => format!(
                "session {}: tests finished, {} passed, {} failed, log archived as {}",
                session, passed, failed, log_name
            ),
            Err(e) => {
                log::warn!("session {}: test log not archived: {}", session, e);
                format!(
                    "session {}: tests finished, {} passed, {} failed, log not archived",
                    session, passed, failed
                )
            }
        };
        notify(out, &client, text);
        Ok(())
    }

    /// Runs one artifact as a child process and collects what it reported.
    fn run_artifact(&self, dir: &Path, name: &str) -> (Option<Outcome>, Vec<Report>) {
        let path = dir.join(name);
        if let Err(e) = make_executable(&path) {
            log::warn!("cannot prepare {}: {}", path.display(), e);
            return (None, vec![Report::new(name, Verdict::Crash, e.to_string())]);
        }

        let stdout = dir.join(format!("{}.stdout", name));
        let stderr = dir.join(format!("{}.stderr", name));
        let mut cmd = Command::new(&path);
        cmd.current_dir(dir);
        let outcome = match cmd_helper::run_with_timeout(cmd, self.timeout, &stdout, &stderr) {
            Ok(o) => o,
            Err(e) => {
                log::warn!("cannot run {}: {}", path.display(), e);
                return (None, vec![Report::new(name, Verdict::Crash, e.to_string())]);
            }
        };

        let mut reports: Vec<Report> = std::fs::read_to_string(&stdout)
            .unwrap_or_default()
            .lines()
            .filter_map(harness::parse_line)
            .collect();
        match outcome {
            Outcome::TimedOut => reports.push(Report::new(
                name,
                Verdict::Timeout,
                format!("killed after {:?}", self.timeout),
            )),
            o if !o.success() && reports.iter().all(|r| r.verdict == Verdict::Pass) => {
                reports.push(Report::new(name, Verdict::Crash, format!("{:?}", o)))
            }
            _ => {}
        }
        (Some(outcome), reports)
    }
}

fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perm = std::fs::metadata(path)?.permissions();
    perm.set_mode(perm.mode() | 0o755);
    std::fs::set_permissions(path, perm)
}

impl Handler for TestNode {
    fn handle(&mut self, out: &dyn Outbox, msg: Message) -> anyhow::Result<()> {
        match msg.command.as_str() {
            command::EXECTESTCASES => self.on_exec(out, &msg),
            command::TESTFILEREQUEST => self.on_manifest(out, &msg),
            other => {
                log::warn!("test node ignores command {:?} from {}", other, msg.from);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), format!("#!/bin/sh\n{}\n", body)).unwrap();
    }

    #[test]
    fn reports_from_child_processes() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "good", "echo 'TEST adds PASS'; echo noise; echo 'TEST subs FAIL 2-1'");
        script(dir.path(), "crashy", "exit 7");
        script(dir.path(), "hangs", "sleep 10");

        let node = TestNode::new(
            dir.path().to_path_buf(),
            Node::new("localhost", 1),
            Duration::from_millis(300),
        );

        let (outcome, reports) = node.run_artifact(dir.path(), "good");
        assert_eq!(outcome, Some(Outcome::Exited(0)));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].verdict, Verdict::Fail);
        assert_eq!(reports[1].detail, "2-1");

        let (_, reports) = node.run_artifact(dir.path(), "crashy");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].verdict, Verdict::Crash);

        let (outcome, reports) = node.run_artifact(dir.path(), "hangs");
        assert_eq!(outcome, Some(Outcome::TimedOut));
        assert_eq!(reports[0].verdict, Verdict::Timeout);

        let (outcome, _) = node.run_artifact(dir.path(), "missing");
        assert_eq!(outcome, None);
    }
}
