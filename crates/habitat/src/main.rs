use clap::Parser;

mod cli;
mod commands;
mod ui;

fn main() {
    // Initialize logging from core crate
    if let Err(e) = habitat_core::logging::init() {
        eprintln!("Could not initialize logging: {}", e);
    }

    let parsed = cli::Cli::parse();
    std::process::exit(parsed.dispatch());
}
