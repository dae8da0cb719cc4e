use std::io::{self, IsTerminal};
use std::process;

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use splice::args::{ListArgs, PatchArgs};
use splice::progress::TerminalProgress;
use splice_core::progress::{NoProgress, ProgressSink};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "splice")]
#[command(about = "Apply selected patches to a packaged artifact")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). SPLICE_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Patch an artifact with the selected patches
    Patch(PatchArgs),
    /// List the patches in one or more bundles
    List(ListArgs),
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("SPLICE_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

fn main() {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };
    init_logging(cli.verbose);

    match cli.command {
        Commands::Patch(args) => {
            let Some((_, patch_matches)) = matches.subcommand() else {
                unreachable!("clap requires a subcommand");
            };
            let rules = match splice::args::selection_rules(patch_matches) {
                Ok(rules) => rules,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(2);
                }
            };

            let cancel = splice::interrupt::install_handler();
            let mut terminal;
            let mut headless = NoProgress;
            let sink: &mut dyn ProgressSink = if io::stderr().is_terminal() {
                terminal = TerminalProgress::new(io::stderr());
                &mut terminal
            } else {
                &mut headless
            };

            let mut stdout = io::stdout();
            match splice::commands::patch::run(&args, &rules, &cancel, sink, &mut stdout) {
                Ok(run) => process::exit(run.exit_code()),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(2);
                }
            }
        }
        Commands::List(args) => match splice::commands::list::run(&args, &mut io::stdout()) {
            Ok(0) => {
                println!("No patches found");
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(2);
            }
        },
    }
}
