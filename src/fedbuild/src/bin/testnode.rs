use fedbuild::config::read_config;
use fedbuild::runtime::NodeRuntime;
use fedbuild::testnode::TestNode;
use litemsg::{FileTransferArgs, Identity};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "testnode", about = "Runs the test artifacts of finished builds.")]
struct Opt {
    /// Federation config file
    #[structopt(short = "c", long = "config", default_value = "fedbuild.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    logging::init_log();

    let opt = Opt::from_args();
    log::info!("options: {:?}", opt);

    let config = read_config(&opt.config)?;
    let book = config.address_book();
    let me = book.get(Identity::TestNode)?.clone();
    std::fs::create_dir_all(&me.base_dir)?;

    let base = me.base_dir.clone();
    let runtime = NodeRuntime::start(
        &me,
        Arc::new(move |_name: &str, args: &FileTransferArgs| {
            fedbuild::session_upload_dir(&base, args)
        }),
    )?;

    let mut node = TestNode::new(
        me.base_dir.clone(),
        book.address(Identity::Repository)?,
        Duration::from_secs(config.test.timeout_secs),
    );
    runtime.run(&mut node);
    Ok(())
}
