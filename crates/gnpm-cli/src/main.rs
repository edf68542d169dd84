#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod commands;
mod logging;

use clap::Parser;
use miette::Result;

#[derive(Parser, Debug)]
#[command(name = "gnpm")]
#[command(version, about = "A concurrent installer for npm registry packages", long_about = None)]
struct Cli {
    /// Command to run (`i` or `install`)
    command: Option<String>,

    /// Package specifier, e.g. `lodash` or `lodash@^4.17.0`
    specifier: Option<String>,
}

fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();

    let (Some(command), Some(specifier)) = (cli.command, cli.specifier) else {
        println!("Usage:\n  gnpm install <package>");
        return Ok(());
    };

    match command.as_str() {
        "i" | "install" => commands::install::run(&specifier),
        _ => {
            println!("Command not found");
            Ok(())
        }
    }
}
