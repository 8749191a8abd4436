mod cmd_file;
mod cmd_stream;
mod error;
mod helpers;

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

use crate::error::CliResult;

/// Metadata for a single command, used for dispatch and help generation.
struct CommandEntry {
    name: &'static str,
    usage: &'static str,
    description: &'static str,
    run: fn(&[String]) -> CliResult,
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// All commands. Order here = order in help output.
const COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        name: "create",
        usage: "clustream create <file> [--cluster-size N] [--key-size N] [--reserved N] [--integrity]",
        description: "Create a new storage file",
        run: cmd_file::cmd_create,
    },
    CommandEntry {
        name: "info",
        usage: "clustream info <file>",
        description: "Show header information",
        run: cmd_file::cmd_info,
    },
    CommandEntry {
        name: "ls",
        usage: "clustream ls <file>",
        description: "List records",
        run: cmd_file::cmd_ls,
    },
    CommandEntry {
        name: "put",
        usage: "clustream put <file> <local-file>",
        description: "Append a local file as a new record",
        run: cmd_stream::cmd_put,
    },
    CommandEntry {
        name: "insert",
        usage: "clustream insert <file> <index> <local-file>",
        description: "Insert a local file as a record at index",
        run: cmd_stream::cmd_insert,
    },
    CommandEntry {
        name: "get",
        usage: "clustream get <file> <index> <local-file>",
        description: "Export a record's stream to a file",
        run: cmd_stream::cmd_get,
    },
    CommandEntry {
        name: "cat",
        usage: "clustream cat <file> <index>",
        description: "Print a record's stream to stdout",
        run: cmd_stream::cmd_cat,
    },
    CommandEntry {
        name: "rm",
        usage: "clustream rm <file> <index>",
        description: "Delete a record and its stream",
        run: cmd_stream::cmd_rm,
    },
    CommandEntry {
        name: "swap",
        usage: "clustream swap <file> <a> <b>",
        description: "Exchange two records",
        run: cmd_stream::cmd_swap,
    },
    CommandEntry {
        name: "truncate",
        usage: "clustream truncate <file> <index> <len>",
        description: "Resize a record's stream (grows with zeros)",
        run: cmd_stream::cmd_truncate,
    },
    CommandEntry {
        name: "clear",
        usage: "clustream clear <file>",
        description: "Delete every record and cluster",
        run: cmd_file::cmd_clear,
    },
    CommandEntry {
        name: "verify",
        usage: "clustream verify <file>",
        description: "Check structural integrity",
        run: cmd_file::cmd_verify,
    },
];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "--help" | "-h" => {
            print_usage();
            return;
        }
        "--version" | "-V" => {
            println!("clustream {}", VERSION);
            return;
        }
        _ => {}
    }

    let cmd_name = &args[1];
    let cmd_args = &args[2..];

    let result = match COMMANDS.iter().find(|c| c.name == cmd_name.as_str()) {
        Some(cmd) => (cmd.run)(cmd_args),
        None => {
            eprintln!("Unknown command: {}", cmd_name);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: clustream <command> [args...]");
    eprintln!();
    eprintln!("Commands:");

    let max_usage_len = COMMANDS.iter().map(|c| c.usage.len()).max().unwrap_or(0);
    for cmd in COMMANDS {
        eprintln!(
            "  {:<width$}  {}",
            cmd.usage,
            cmd.description,
            width = max_usage_len
        );
    }

    eprintln!();
    eprintln!("Options:");
    eprintln!("  --help, -h       Show this help message");
    eprintln!("  --version, -V    Show version");
    eprintln!();
    eprintln!("Set RUST_LOG (e.g. RUST_LOG=clustream=debug) for diagnostic output.");
}
