use std::io;
use std::process;

use clap::CommandFactory;
use tracing::error;

use flashwright::cli::{self, Commands};
use flashwright::error::FlashwrightError;
use flashwright::{init_logging, run_setup, run_validate};

fn main() {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {:#}", e);
            process::exit(1);
        }
    };

    if let Commands::Completion(opts) = &args.command {
        let mut command = cli::Cli::command();
        clap_complete::generate(opts.shell, &mut command, "flashwright", &mut io::stdout());
        return;
    }

    let log_level = match &args.command {
        Commands::Setup(opts) => opts.log_level,
        Commands::Validate(opts) => opts.log_level,
        Commands::Completion(_) => unreachable!("completion returns above"),
    };

    if let Err(e) = init_logging(log_level) {
        eprintln!("error: {:#}", e);
        process::exit(1);
    }

    let result = match &args.command {
        Commands::Setup(opts) => run_setup(opts),
        Commands::Validate(opts) => run_validate(opts),
        Commands::Completion(_) => unreachable!("completion returns above"),
    };

    if let Err(e) = result {
        // Report the error kind and message plainly; no backtrace noise.
        error!("{:#}", e);
        let code = e
            .downcast_ref::<FlashwrightError>()
            .map(FlashwrightError::exit_code)
            .unwrap_or(1);
        process::exit(code);
    }
}
