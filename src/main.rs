// Cyclescope: task-cycle structuring engine
//
// Rebuilds a dynamic control-flow graph from a Markov execution profile,
// collapses control-flow idioms with semantics-preserving rewrites, and
// segments the recurrent structure into task cycles.

use clap::Parser;
use is_terminal::IsTerminal;
use tracing::error;

use cyclescope::cli::{self, Cli};

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    match cli::run(cli) {
        Ok(()) => {}
        Err(e) => {
            error!("{e:#}");
            std::process::exit(cli::exit_code_for(&e));
        }
    }
}
