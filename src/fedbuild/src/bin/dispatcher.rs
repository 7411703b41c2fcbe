use fedbuild::config::{read_config, resolve_program};
use fedbuild::dispatcher::{Dispatcher, ProcessSpawner, WorkerPool};
use fedbuild::runtime::NodeRuntime;
use litemsg::{FileTransferArgs, Identity};
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "dispatcher", about = "Pairs build requests with idle workers.")]
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
    let me = config.address_book().get(Identity::Dispatcher)?.clone();
    std::fs::create_dir_all(&me.base_dir)?;

    let inbox = me.base_dir.clone();
    let runtime = NodeRuntime::start(
        &me,
        Arc::new(move |_name: &str, _args: &FileTransferArgs| inbox.clone()),
    )?;

    let spawner = ProcessSpawner::new(
        resolve_program(&config.pool.worker_program),
        opt.config.clone(),
    );
    let pool = WorkerPool::new(&config.pool.host, config.pool.base_port, spawner);
    let mut dispatcher = Dispatcher::new(pool);
    dispatcher.start_matchmaker(runtime.comm().handle(), &me.base_dir)?;

    runtime.run(&mut dispatcher);
    Ok(())
}
