use anyhow::Result;
use clap::Parser;

mod cli;
mod logging;
mod probe;
mod serve;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init_logging(args.log_level);
    match args.cmd {
        cli::Cmd::Serve(opts) => serve::run(opts),
        cli::Cmd::Info(opts) => probe::info(opts),
        cli::Cmd::Read(opts) => probe::read(opts),
        cli::Cmd::Clear(opts) => probe::clear(opts),
    }
}
