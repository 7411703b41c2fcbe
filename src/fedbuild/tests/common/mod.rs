#![allow(dead_code)]

use fedbuild::command::{self, arg};
use fedbuild::compiler::{CompileJob, CompileOutput, Compiler};
use litemsg::{FileTransferArgs, Message, Node, Outbox};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Mutex;
use utils::cmd_helper::Outcome;

#[derive(Debug, Clone)]
pub enum Event {
    Post(Message),
    Upload {
        path: PathBuf,
        to: Node,
        args: FileTransferArgs,
    },
}

/// Remembers everything a node sends, in order, without touching the network.
pub struct RecordingOutbox {
    local: Node,
    events: Mutex<Vec<Event>>,
    unreachable: Mutex<Vec<Node>>,
}

impl RecordingOutbox {
    pub fn new(local: Node) -> Self {
        RecordingOutbox {
            local,
            events: Mutex::new(Vec::new()),
            unreachable: Mutex::new(Vec::new()),
        }
    }

    pub fn refuse(&self, node: &Node) {
        self.unreachable.lock().unwrap().push(node.clone());
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn posts(&self) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Post(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn posts_of(&self, cmd: &str) -> Vec<Message> {
        self.posts().into_iter().filter(|m| m.command == cmd).collect()
    }

    pub fn uploads_to(&self, node: &Node) -> Vec<PathBuf> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Upload { path, to, .. } if &to == node => Some(path),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.posts_of(command::NOTIFICATION)
            .iter()
            .map(|m| m.arg(arg::NOTIFMSG).unwrap_or_default().to_owned())
            .collect()
    }
}

impl Outbox for RecordingOutbox {
    fn local(&self) -> &Node {
        &self.local
    }

    fn post(&self, mut msg: Message) {
        msg.from = self.local.clone();
        self.events.lock().unwrap().push(Event::Post(msg));
    }

    fn post_file(&self, path: &Path, to: &Node, args: Option<FileTransferArgs>) -> litemsg::Result<()> {
        if self.unreachable.lock().unwrap().contains(to) {
            return Err(litemsg::Error::Unreachable(to.clone(), 5));
        }
        if !path.is_file() {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file").into());
        }
        self.events.lock().unwrap().push(Event::Upload {
            path: path.to_path_buf(),
            to: to.clone(),
            args: args.unwrap_or_default(),
        });
        Ok(())
    }
}

/// Stands in for the compiler: counts calls and drops one executable per
/// compile unit, named after its first source.
#[derive(Default)]
pub struct CountingCompiler {
    pub calls: AtomicUsize,
    pub stdout: String,
    pub fail: bool,
}

impl Compiler for CountingCompiler {
    fn compile(&self, job: &CompileJob) -> anyhow::Result<CompileOutput> {
        use std::os::unix::fs::PermissionsExt;
        self.calls.fetch_add(1, SeqCst);
        if self.fail {
            anyhow::bail!("compiler crashed");
        }
        let stem = Path::new(&job.sources[0])
            .file_stem()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let artifact = job.session_dir.join(stem);
        std::fs::write(&artifact, b"#!/bin/sh\n")?;
        std::fs::set_permissions(&artifact, std::fs::Permissions::from_mode(0o755))?;
        Ok(CompileOutput {
            command: format!("cc {}", job.sources.join(" ")),
            stdout: self.stdout.clone(),
            stderr: String::new(),
            outcome: Outcome::Exited(0),
        })
    }
}

pub fn calls(c: &CountingCompiler) -> usize {
    c.calls.load(SeqCst)
}
