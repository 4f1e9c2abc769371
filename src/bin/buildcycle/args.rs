use camino::Utf8PathBuf;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file; searched for if not given.
    #[arg(short, long)]
    pub config: Option<Utf8PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Packages to rebuild. With no packages given, a full detection
    /// cycle decides what to build.
    pub pkgbases: Vec<String>,
}
