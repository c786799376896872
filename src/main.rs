use std::fs::OpenOptions;
use std::path::PathBuf;

use env_logger::{Builder, Env, Target};

const LOG_ENV: &str = "ARTFEED_LOG";
const LOG_FILE_ENV: &str = "ARTFEED_LOG_FILE";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let interactive = args.is_empty();
    init_logging(interactive);

    let outcome = if interactive {
        artfeed::run()
    } else {
        match handle_cli_flags(&args) {
            Some(outcome) => outcome,
            None => {
                eprintln!("unknown arguments: {}\n\n{}", args.join(" "), help_text());
                std::process::exit(2);
            }
        }
    };

    if let Err(err) = outcome {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// Returns `None` when the arguments are not recognised.
fn handle_cli_flags(args: &[String]) -> Option<anyhow::Result<()>> {
    match args.first().map(String::as_str)? {
        "--version" | "-V" => {
            println!("artfeed {}", artfeed::VERSION);
            Some(Ok(()))
        }
        "--help" | "-h" => {
            println!("{}", help_text());
            Some(Ok(()))
        }
        "--check-config" => Some(artfeed::app::check_config().map(|yaml| print!("{yaml}"))),
        "--upload-avatar" => {
            let (Some(artist_id), Some(file)) = (args.get(1), args.get(2)) else {
                return Some(Err(anyhow::anyhow!(
                    "usage: artfeed --upload-avatar <ARTIST_ID> <FILE>"
                )));
            };
            Some(artfeed::app::upload_avatar(artist_id, &PathBuf::from(file)))
        }
        _ => None,
    }
}

fn help_text() -> &'static str {
    "artfeed - Swipe through artists' short videos from the terminal.\n\n  \
     --version, -V                        Show version and exit\n  \
     --help,    -h                        Show this help message\n  \
     --check-config                       Print the effective configuration\n  \
     --upload-avatar <ARTIST_ID> <FILE>   Replace an artist's profile picture\n\n\
     Set ARTFEED_LOG to a level (e.g. debug) and ARTFEED_LOG_FILE to a path to capture logs."
}

/// The TUI owns the terminal, so logs only go somewhere when a file is set.
fn init_logging(interactive: bool) {
    let mut builder = Builder::from_env(Env::new().filter_or(LOG_ENV, "warn"));
    match std::env::var_os(LOG_FILE_ENV) {
        Some(path) => match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(err) => {
                eprintln!("warning: cannot open log file {}: {err}", PathBuf::from(path).display());
                if interactive {
                    return;
                }
            }
        },
        None if interactive => return,
        None => {}
    }
    if let Err(message) = install_logger(builder) {
        eprintln!("{message}");
    }
}

fn install_logger(mut builder: Builder) -> Result<(), String> {
    builder
        .try_init()
        .map_err(|err| format!("warning: logging disabled: {err}"))
}
