//! A federated build-and-test service.
//!
//! Clients submit requests to the [`repository`], the [`dispatcher`] hands them
//! to an idle [`worker`], the worker compiles and forwards artifacts to the
//! [`testnode`], and every node reports progress back to the client.
use litemsg::FileTransferArgs;
use std::path::{Component, Path, PathBuf};

pub mod command;
pub mod compiler;
pub mod config;
pub mod dispatcher;
pub mod harness;
pub mod repository;
pub mod request;
pub mod runtime;
pub mod testnode;
pub mod worker;

/// The per-session directory under `base`. A session id that is not a plain
/// name is refused so that uploads cannot leave `base`.
pub fn session_dir(base: &Path, session: &str) -> Option<PathBuf> {
    let mut comps = Path::new(session).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(name)), None) => Some(base.join(name)),
        _ => None,
    }
}

/// Files uploaded for a session go to its directory, everything else to `base`.
pub fn session_upload_dir(base: &Path, args: &FileTransferArgs) -> PathBuf {
    args.session_id
        .as_deref()
        .and_then(|s| session_dir(base, s))
        .unwrap_or_else(|| base.to_path_buf())
}
