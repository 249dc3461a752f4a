use clap::Parser;
use sleeper_cli::{run_cli, Cli};
use tracing::error;

#[tokio::main]
async fn main() {
    // Help and version requests are not failures
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let exit_code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(exit_code);
        }
    };

    if let Err(e) = run_cli(cli).await {
        error!("CLI error: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
