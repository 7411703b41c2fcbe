use fedbuild::compiler::ExternalCompiler;
use fedbuild::config::read_config;
use fedbuild::runtime::NodeRuntime;
use fedbuild::worker::{Worker, WorkerSettings};
use litemsg::{FileTransferArgs, Identity};
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "worker", about = "Builds one session at a time for the dispatcher.")]
struct Opt {
    /// Host to listen on, as the dispatcher knows it
    host: String,

    /// Port to listen on
    port: u16,

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
    let me = config.worker_node(&opt.host, opt.port);
    std::fs::create_dir_all(&me.base_dir)?;

    let base = me.base_dir.clone();
    let runtime = NodeRuntime::start(
        &me,
        Arc::new(move |_name: &str, args: &FileTransferArgs| {
            fedbuild::session_upload_dir(&base, args)
        }),
    )?;

    let settings = WorkerSettings {
        base_dir: me.base_dir.clone(),
        dispatcher: book.address(Identity::Dispatcher)?,
        repository: book.address(Identity::Repository)?,
        test_node: book.address(Identity::TestNode)?,
        artifact_extensions: config.build.artifact_extensions.clone(),
    };
    let mut worker = Worker::new(settings, ExternalCompiler::new(&config.build));
    worker.announce_ready(runtime.comm());

    runtime.run(&mut worker);
    Ok(())
}
