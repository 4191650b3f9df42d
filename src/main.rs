use anyhow::Result;
use clap::Parser;
use fusenfs::modules::daemon::Daemon;
use fusenfs::{Composer, FilesystemManager, LinkedConnector, MountConfig, MountError};
use log::{error, info, LevelFilter};
use nix::sys::stat::{umask, Mode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Single-threaded operation
    #[arg(short = 's')]
    single_threaded: bool,

    /// Stay in the foreground
    #[arg(short = 'f')]
    foreground: bool,

    /// Write the daemon's process ID to this file
    #[arg(long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Mount options, e.g. fsname=nfs://server/export,allow_other
    #[arg(short = 'o', value_name = "OPT[,OPT...]")]
    options: Vec<String>,

    /// Mount point
    mount_point: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(log_level).init();

    if let Err(err) = run(cli) {
        error!("{}", err);
        let code = err
            .downcast_ref::<MountError>()
            .map(MountError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    // creation modes reach the backend as the caller asked
    umask(Mode::empty());

    let mount_point = if cli.mount_point.is_relative() {
        std::env::current_dir()?.join(&cli.mount_point)
    } else {
        cli.mount_point
    };
    let config =
        MountConfig::from_options(mount_point, &cli.options).single_threaded(cli.single_threaded);

    let composed = Composer::compose(&config, &LinkedConnector)?;
    info!("Starting fusenfs...");

    if !cli.foreground {
        let pid_file = match cli.pid_file {
            Some(path) if path.is_relative() => Some(std::env::current_dir()?.join(path)),
            other => other,
        };
        Daemon::new(pid_file, "/").start()?;
    }

    FilesystemManager::new(composed).mount()?;
    Ok(())
}
