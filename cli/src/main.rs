//! chainledger CLI — inspect and manage ingestion state.
//!
//! Usage:
//! ```bash
//! chainledger info
//! chainledger version
//! chainledger help
//! ```

use std::env;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("chainledger {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("chainledger {}", env!("CARGO_PKG_VERSION"));
    println!("Exactly-once blockchain event ingestion and reconciliation engine\n");
    println!("USAGE:");
    println!("    chainledger <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info     Show ChainLedger configuration info");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    println!("ChainLedger v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default confirmations required: 12 blocks");
    println!("  Default scan batch: 5000 blocks/call");
    println!("  Default retry budget: 3 attempts/event");
    println!("  Storage backends: memory, SQLite (feature: sqlite), Postgres (feature: postgres)");
    println!("  Sources: any (chain, contract, event type) stream with a registered applier");
}
