use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = dblog_cli::Cli::parse();
    dblog_cli::init_tracing();
    dblog_cli::run_cli(cli)
}
