mod cli;
mod context;
mod paths;
mod run;

use anyhow::Result;
use cli::Command;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    let config = run::load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Serve(args) => run::serve(args, config),
        Command::Probe(args) => run::probe(args, config),
        Command::Where(args) => run::where_cmd(args, cli.config.as_deref(), &config),
    }
}
