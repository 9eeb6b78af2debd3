use chatflow::cli::{self, Cli, Command};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Check { config } => cli::handle_check(config.as_deref()),
        Command::Chat { config, from } => cli::handle_chat(config.as_deref(), &from).await,
        Command::Version => {
            cli::handle_version();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
