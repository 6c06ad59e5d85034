mod fix;
mod help_cloud;
mod run;

use crate::cli::args::Cli;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    if cli.help_cloud {
        return help_cloud::run();
    }
    if let Some(path) = cli.fix.clone() {
        return fix::run(&path);
    }
    run::run(cli).await
}
