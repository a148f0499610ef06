use clap::Parser;

mod app;
mod audit;
mod cli;
mod config;
mod errors;
mod gate;
mod ledger;
mod manifest_input;
mod module;
mod preload;
mod resolver;
mod runner;
mod secrets;
mod status;
mod streams;
mod summarizer;
#[cfg(test)]
mod testing;
mod upstream;
mod util;

fn main() {
    let args = cli::RootArgs::parse();
    std::process::exit(app::run(args));
}
