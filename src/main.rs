use botlockbox::cli::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Seal(args) => botlockbox::cli::seal::run(args),
        Commands::Serve(args) => botlockbox::cli::serve::run(args).await,
        Commands::Reload(args) => botlockbox::cli::reload::run(args),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
