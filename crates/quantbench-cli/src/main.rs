use clap::Parser;

mod cli;
mod console;
mod exit_codes;
mod logging;

use cli::args::Cli;
use cli::commands::dispatch;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.logfile.as_deref(), cli.verbose) {
        eprintln!("fatal: {e:#}");
        std::process::exit(exit_codes::ERROR);
    }
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}
