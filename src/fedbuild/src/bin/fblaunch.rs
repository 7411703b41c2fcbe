// $ fblaunch -c fedbuild.toml -o output
// starts the repository, the dispatcher and the test node on this host;
// Ctrl-C stops all of them.
use fedbuild::config::resolve_program;
use nix::sys::signal;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "fblaunch", about = "Launcher of the fixed federation nodes.")]
struct Opt {
    /// Federation config file
    #[structopt(short = "c", long = "config", default_value = "fedbuild.toml")]
    config: PathBuf,

    /// Output directory of log files
    #[structopt(short = "o", long = "output", default_value = "output")]
    output: PathBuf,
}

const NODES: [&str; 3] = ["repository", "dispatcher", "testnode"];

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(sig: i32) {
    assert_eq!(sig, signal::SIGINT as i32);
    TERMINATE.store(true, SeqCst);
}

fn start_node(name: &'static str, config: &Path, output_dir: &Path) -> anyhow::Result<Command> {
    let stdout = utils::fs::open_with_create_append(output_dir.join(format!("{}.stdout", name)))?;
    let stderr = utils::fs::open_with_create_append(output_dir.join(format!("{}.stderr", name)))?;
    let mut cmd = Command::new(resolve_program(Path::new(name)));
    cmd.arg("--config").arg(config).stdout(stdout).stderr(stderr);
    Ok(cmd)
}

fn launch(opt: Opt) -> anyhow::Result<()> {
    // sanity check before starting anything
    fedbuild::config::read_config(&opt.config)?;

    // create or clean directory
    let output_dir = &opt.output;
    if output_dir.exists() {
        std::fs::remove_dir_all(output_dir)?;
    }
    std::fs::create_dir_all(output_dir)?;

    let mut handles = vec![];
    for &name in NODES.iter() {
        let cmd = start_node(name, &opt.config, output_dir)?;
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Err(e) = utils::cmd_helper::poll_cmd(cmd, &TERMINATE) {
                    log::error!("{} failed: {}", name, e);
                }
            })?;
        handles.push(handle);
    }

    for h in handles {
        if h.join().is_err() {
            log::error!("a supervisor thread panicked");
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    logging::init_log();

    let opt = Opt::from_args();
    log::info!("options: {:?}", opt);

    // register sigint handler
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_sigint),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe {
        signal::sigaction(signal::SIGINT, &sig_action)?;
    }

    launch(opt)
}
