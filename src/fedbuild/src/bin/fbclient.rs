use fedbuild::command::{self, arg};
use fedbuild::config::read_config;
use fedbuild::request::{self, BuildRequest};
use litemsg::{Comm, FileTransferArgs, Identity, Message, Outbox};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "fbclient", about = "Command-line client of the build federation.")]
struct Opt {
    /// Federation config file
    #[structopt(short = "c", long = "config", default_value = "fedbuild.toml")]
    config: PathBuf,

    /// Stop listening once no notification arrived for this many seconds
    #[structopt(short = "w", long = "wait", default_value = "60")]
    wait: u64,

    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, StructOpt)]
enum Cmd {
    /// List a directory of the repository, `$` being its root
    Browse {
        #[structopt(default_value = "$")]
        dir: String,
    },
    /// Upload a build request file to the repository and submit it
    Submit { request: PathBuf },
    /// Ask the dispatcher to start worker processes
    StartWorkers { count: usize },
    /// Ask the dispatcher to stop every worker
    StopWorkers,
}

fn main() -> anyhow::Result<()> {
    logging::init_log();

    let opt = Opt::from_args();
    log::debug!("options: {:?}", opt);

    let config = read_config(&opt.config)?;
    let book = config.address_book();
    let me = book.get(Identity::Client)?.clone();
    std::fs::create_dir_all(&me.base_dir)?;

    let downloads = me.base_dir.clone();
    let mut comm = Comm::start(
        Identity::Client,
        &me.service_url(),
        Arc::new(move |_name: &str, _args: &FileTransferArgs| downloads.clone()),
    )?;
    let repository = book.address(Identity::Repository)?;
    let dispatcher = book.address(Identity::Dispatcher)?;
    let wait = Duration::from_secs(opt.wait);

    match opt.cmd {
        Cmd::Browse { dir } => {
            comm.post(
                Message::request(command::GETDIRCONTENTS, repository).with_arg(arg::DIRNAME, &dir),
            );
            browse_reply(&comm, wait)?;
        }
        Cmd::Submit { request } => {
            if BuildRequest::parse(&request).is_none() {
                anyhow::bail!("{} is not a valid build request", request.display());
            }
            comm.post_file(&request, &repository, None)?;
            let project = request::file_name(&request.to_string_lossy());
            comm.post(
                Message::request(command::BUILDREQUEST, repository)
                    .with_arg(arg::PROJECT, project)
                    .with_arg(arg::CLIENTDETAILS, comm.local()),
            );
            print_notifications(&comm, wait);
        }
        Cmd::StartWorkers { count } => {
            comm.post(
                Message::request(command::STARTCHILDPROCESS, dispatcher)
                    .with_arg(arg::NOOFPROC, count),
            );
            print_notifications(&comm, wait);
        }
        Cmd::StopWorkers => {
            comm.post(Message::request(command::STOPCHILDPROCESS, dispatcher));
            print_notifications(&comm, wait);
        }
    }

    comm.close();
    Ok(())
}

fn browse_reply(comm: &Comm, wait: Duration) -> anyhow::Result<()> {
    while let Some(msg) = comm.inbound().dequeue_timeout(wait) {
        if msg.command == command::NOTIFICATION {
            print_notification(&msg);
            continue;
        }
        if msg.command != command::GETDIRCONTENTS {
            continue;
        }

        println!("{}", msg.arg(arg::CURRDIR).unwrap_or("?"));
        if !msg.error.is_empty() {
            println!("  error: {}", msg.error);
        }
        for d in msg.list(arg::DIRCOUNT, arg::DIRNAME) {
            println!("  {}/", d);
        }
        for f in msg.list(arg::FILECOUNT, arg::FILE) {
            println!("  {}", f);
        }
        return Ok(());
    }
    anyhow::bail!("the repository did not answer within {:?}", wait)
}

fn print_notifications(comm: &Comm, wait: Duration) {
    while let Some(msg) = comm.inbound().dequeue_timeout(wait) {
        if msg.command == command::NOTIFICATION {
            print_notification(&msg);
        }
    }
}

fn print_notification(msg: &Message) {
    println!(
        "[{} {}] {}",
        msg.identity,
        msg.from,
        msg.arg(arg::NOTIFMSG).unwrap_or_default()
    );
}
