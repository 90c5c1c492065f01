//! StatusRelay - instrument status relay
//!
//! Entry point for the statusrelay CLI application.

use clap::Parser;
use statusrelay::{
    cli::Cli,
    error::{ExitCode, StructuredError},
};

fn main() {
    let cli = Cli::parse();
    let json_errors = cli.json_errors;

    match statusrelay::run_app(cli) {
        Ok(code) => std::process::exit(code.as_i32()),
        Err(err) => {
            // A connect attempt cut short by Ctrl+C surfaces as a closed channel.
            let exit_code = if err
                .downcast_ref::<statusrelay::channel::ChannelError>()
                .is_some_and(|e| matches!(e, statusrelay::channel::ChannelError::Closed))
            {
                ExitCode::Interrupted
            } else {
                ExitCode::GeneralError
            };

            if json_errors {
                let structured = StructuredError::new(&err, exit_code);
                if let Ok(json) = serde_json::to_string_pretty(&structured) {
                    eprintln!("{}", json);
                } else {
                    eprintln!("[{}] Error: {}", exit_code.code_prefix(), err);
                }
            } else {
                eprintln!("[{}] Error: {}", exit_code.code_prefix(), err);
            }

            std::process::exit(exit_code.as_i32());
        }
    }
}
