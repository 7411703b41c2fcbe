use crate::command::{self, arg};
use crate::request;
use crate::runtime::{client_of, notify, Handler};
use litemsg::{FileTransferArgs, Identity, Message, Node, Outbox};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// Names the repository root in every path it hands out.
pub const ROOT: &str = "$";

pub const BUILD_REQUESTS: &str = "BuildRequests";
pub const BUILD_LOGS: &str = "BuildLogs";
pub const TEST_LOGS: &str = "TestLogs";

/// Creates the fixed sub-folders under `root`.
pub fn bootstrap(root: &Path) -> std::io::Result<()> {
    for dir in &[BUILD_REQUESTS, BUILD_LOGS, TEST_LOGS] {
        std::fs::create_dir_all(root.join(dir))?;
    }
    Ok(())
}

/// Uploads are filed purely by who sent them.
pub fn upload_dir(root: &Path, args: &FileTransferArgs) -> PathBuf {
    match args.identity {
        Identity::Client => root.join(BUILD_REQUESTS),
        Identity::Worker => root.join(BUILD_LOGS),
        Identity::TestNode => root.join(TEST_LOGS),
        _ => root.to_path_buf(),
    }
}

/// Resolves a repository path such as `$/src/../lib` into its components,
/// never climbing above the root.
pub fn normalize(requested: &str) -> Vec<String> {
    let trimmed = requested.trim();
    let rest = trimmed.strip_prefix(ROOT).unwrap_or(trimmed);
    let mut parts: Vec<String> = Vec::new();
    for comp in Path::new(&rest.replace('\\', "/")).components() {
        match comp {
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts
}

/// The canonical display form of normalized components.
pub fn display_path(parts: &[String]) -> String {
    std::iter::once(ROOT)
        .chain(parts.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join("/")
}

pub struct Repository {
    root: PathBuf,
    dispatcher: Node,
    /// every file-serving session runs under this lock
    streaming: Mutex<()>,
}

impl Repository {
    pub fn new(root: PathBuf, dispatcher: Node) -> Self {
        Repository {
            root,
            dispatcher,
            streaming: Mutex::new(()),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, parts: &[String]) -> PathBuf {
        parts.iter().fold(self.root.clone(), |p, c| p.join(c))
    }

    fn on_dir_contents(&self, out: &dyn Outbox, msg: &Message) {
        let requested = msg.arg(arg::DIRNAME).unwrap_or(ROOT);
        let parts = normalize(requested);
        let dir = self.resolve(&parts);

        let mut reply = Message::reply(command::GETDIRCONTENTS, msg.from.clone())
            .with_arg(arg::CURRDIR, display_path(&parts))
            .with_auto_disconnect();
        let (dirs, files) = match utils::fs::list_dir(&dir) {
            Ok(listing) => listing,
            Err(e) => {
                log::warn!("cannot list {}: {}", dir.display(), e);
                reply.error = format!("cannot list {}: {}", display_path(&parts), e);
                (Vec::new(), Vec::new())
            }
        };
        reply.set_list(arg::DIRCOUNT, arg::DIRNAME, &dirs);
        reply.set_list(arg::FILECOUNT, arg::FILE, &files);
        out.post(reply);
    }

    fn on_build_request(&self, out: &dyn Outbox, msg: &Message) {
        let client = client_of(msg);
        let project = msg
            .arg(arg::PROJECT)
            .map(request::file_name)
            .unwrap_or_default();
        let path = self.root.join(BUILD_REQUESTS).join(&project);

        if project.is_empty() || !path.is_file() {
            log::warn!("build request {:?} not found", project);
            notify(
                out,
                &client,
                format!("build request {} not found in the repository", project),
            );
            return;
        }

        if let Err(e) = out.post_file(&path, &self.dispatcher, None) {
            log::warn!("cannot hand {} to the dispatcher: {}", project, e);
            notify(
                out,
                &client,
                format!("dispatcher unreachable, build request {} not submitted", project),
            );
            return;
        }

        out.post(
            Message::request(command::BUILDREQUEST, self.dispatcher.clone())
                .with_arg(arg::PROJECT, &project)
                .with_arg(arg::CLIENTDETAILS, &client),
        );
        notify(
            out,
            &client,
            format!("build request {} forwarded to the dispatcher", project),
        );
    }

    fn on_file_request(&self, out: &dyn Outbox, msg: &Message) {
        let session = msg.arg(arg::SESSIONID).unwrap_or_default().to_owned();
        let wanted = msg.list(arg::FILECOUNT, arg::FILE);

        let streamed: Vec<String> = {
            let _guard = match self.streaming.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            wanted
                .iter()
                .filter(|name| {
                    let path = self.resolve(&normalize(name));
                    if !path.is_file() {
                        log::warn!("session {}: {} is not in the repository", session, name);
                        return false;
                    }
                    match out.post_file(&path, &msg.from, Some(FileTransferArgs::for_session(&session))) {
                        Ok(()) => true,
                        Err(e) => {
                            log::warn!("session {}: streaming {} failed: {}", session, name, e);
                            false
                        }
                    }
                })
                .cloned()
                .collect()
        };
        log::info!(
            "session {}: streamed {} of {} files to {}",
            session,
            streamed.len(),
            wanted.len(),
            msg.from
        );

        let mut done = Message::reply(command::FILEREQUESTCOMPLETE, msg.from.clone())
            .with_arg(arg::SESSIONID, &session)
            .with_auto_disconnect();
        done.set_list(arg::FILECOUNT, arg::FILE, &streamed);
        out.post(done);
    }
}

impl Handler for Repository {
    fn handle(&mut self, out: &dyn Outbox, msg: Message) -> anyhow::Result<()> {
        match msg.command.as_str() {
            command::GETDIRCONTENTS => self.on_dir_contents(out, &msg),
            command::BUILDREQUEST => self.on_build_request(out, &msg),
            command::FILEREQUEST => self.on_file_request(out, &msg),
            other => log::warn!("repository ignores command {:?} from {}", other, msg.from),
        }
        Ok(())
    }
}
