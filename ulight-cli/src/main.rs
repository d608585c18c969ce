//! ulight CLI - Command-line front end for the ulight WebAssembly highlighter.

mod commands;
mod observability;

use anyhow::Result;
use clap::{Parser, Subcommand};
use observability::{TracingConfig, init_tracing};
use std::path::PathBuf;

/// ulight - syntax highlighting through a WebAssembly module.
#[derive(Parser)]
#[command(name = "ulight")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the ulight WebAssembly module
    #[arg(short, long, global = true, env = "ULIGHT_WASM", default_value = "ulight.wasm")]
    module: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Highlight a source file as HTML
    Highlight {
        /// Source file, or `-` for stdin
        input: Option<PathBuf>,

        /// Language name or numeric id (inferred from the file name if omitted)
        #[arg(short, long)]
        lang: Option<String>,

        /// Write HTML to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the highlighted spans of a source file
    Tokens {
        /// Source file, or `-` for stdin
        input: Option<PathBuf>,

        /// Language name or numeric id (inferred from the file name if omitted)
        #[arg(short, long)]
        lang: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List the languages the module supports
    Languages {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

fn setup_logging(verbosity: u8) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // ULIGHT_LOG and RUST_LOG override the verbosity flag.
    init_tracing(TracingConfig::from_env(filter))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Highlight {
            input,
            lang,
            output,
        } => commands::highlight::run(
            &cli.module,
            input.as_deref(),
            lang.as_deref(),
            output.as_deref(),
        ),
        Commands::Tokens { input, lang, json } => {
            commands::tokens::run(&cli.module, input.as_deref(), lang.as_deref(), json)
        }
        Commands::Languages { json } => commands::languages::run(&cli.module, json),
        Commands::Version => commands::version::run(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn highlight_args_parse() {
        let cli = Cli::try_parse_from([
            "ulight", "highlight", "main.cpp", "--lang", "cpp", "-o", "out.html", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Highlight {
                input,
                lang,
                output,
            } => {
                assert_eq!(input, Some(PathBuf::from("main.cpp")));
                assert_eq!(lang.as_deref(), Some("cpp"));
                assert_eq!(output, Some(PathBuf::from("out.html")));
            }
            _ => panic!("expected highlight"),
        }
    }

    #[test]
    fn module_flag_is_global() {
        let cli =
            Cli::try_parse_from(["ulight", "languages", "--json", "--module", "x.wasm"]).unwrap();
        assert_eq!(cli.module, PathBuf::from("x.wasm"));
        assert!(matches!(cli.command, Commands::Languages { json: true }));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["ulight"]).is_err());
    }
}
