use std::io;

use anyhow::Result;
use clap::{CommandFactory, FromArgMatches};

use ttscope::analyzers;
use ttscope::cli::Cli;

fn do_main() -> Result<()> {
    env_logger::init();

    let after_help = format!("Available analyzers:\n{}", analyzers::describe_all());
    let matches = Cli::command().after_help(after_help).get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    let stdout = io::stdout();
    ttscope::run(cli.into_config(), &mut stdout.lock())
}

fn main() {
    if let Err(err) = do_main() {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
