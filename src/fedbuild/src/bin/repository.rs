use fedbuild::config::read_config;
use fedbuild::repository::{self, Repository};
use fedbuild::runtime::NodeRuntime;
use litemsg::{FileTransferArgs, Identity};
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "repository", about = "Serves sources and archives build and test logs.")]
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
    let me = book.get(Identity::Repository)?.clone();
    repository::bootstrap(&me.base_dir)?;

    let root = me.base_dir.clone();
    let runtime = NodeRuntime::start(
        &me,
        Arc::new(move |_name: &str, args: &FileTransferArgs| {
            repository::upload_dir(&root, args)
        }),
    )?;

    let mut repo = Repository::new(me.base_dir.clone(), book.address(Identity::Dispatcher)?);
    runtime.run(&mut repo);
    Ok(())
}
