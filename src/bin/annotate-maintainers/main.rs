//! Filter appending maintainer handles to lines mentioning managed
//! packages, e.g. for piping `pacman -Qu` style reports into chat.

use std::io::{BufRead, Write};
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;

use buildcycle::config::Config;
use buildcycle::recipe;
use buildcycle::report::{annotate_line, maintainer_handles};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; searched for if not given.
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let (config, _) = match Config::load(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("annotate-maintainers: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let (recipes, _errors) = match recipe::load_all(&config.buildcycle.repodir) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("annotate-maintainers: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let handles = maintainer_handles(&recipes);

    let stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();
    for line in stdin.lines() {
        let Ok(line) = line else { break };
        if writeln!(stdout, "{}", annotate_line(&line, &handles)).is_err() {
            break;
        }
    }
    ExitCode::SUCCESS
}
