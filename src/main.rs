//! Entry point. A re-exec'd child process (argv[1] == the launcher sentinel)
//! never reaches the CLI parser at all — it runs stage two of the launch
//! pipeline and execs the user's command. Everything else goes through the
//! normal daemon/client split.

use clap::Parser;

use phiocker::core::cmd::{Cli, Commands};
use phiocker::core::launcher;

fn main() {
    env_logger::init();

    let raw_args: Vec<String> = std::env::args().collect();
    if raw_args.get(1).map(String::as_str) == Some(launcher::SENTINEL) {
        let base_path = std::path::PathBuf::from(&raw_args[2]);
        let name = &raw_args[3];
        launcher::run_child(&base_path, name);
    }

    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().expect("failed to start the tokio runtime");
    let exit_code = runtime.block_on(async move {
        if matches!(cli.command, Commands::Daemon) {
            match phiocker::core::run_daemon().await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("phiocker: {e}");
                    1
                }
            }
        } else {
            match phiocker::front::run_client(cli).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("phiocker: {e}");
                    1
                }
            }
        }
    });

    std::process::exit(exit_code);
}
