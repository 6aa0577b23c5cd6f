// relcache: inspect the relation cache a build would start from
//
// This is the main entry point for the relcache binary.

use anyhow::{Context, Result};
use relcache::cli::{handle_command, Args};
use relcache::observability::init_tracing;

fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();

    let args = Args::parse(std::env::args().skip(1))?;
    init_tracing(args.verbose);

    let profile = if args.command.needs_profile() {
        Some(args.resolve_profile().with_context(|| {
            format!("Could not resolve profile \"{}\"", args.profile)
        })?)
    } else {
        None
    };

    let output = handle_command(&args.command, profile.as_ref())?;
    println!("{}", output);
    Ok(())
}
