//! Porter CLI: serve a project in development or precompile it.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use porter::{App, AppConfig};

mod logger;
mod server;

#[derive(Debug, Parser)]
#[command(name = "porter", version, about = "Server-integrated asset pipeline")]
struct Cli {
    /// Print debug logs
    #[arg(long, global = true)]
    verbose: bool,

    /// Only print errors
    #[arg(long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the project with hot reload
    Serve {
        /// Project root
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:5000")]
        addr: SocketAddr,
    },
    /// Precompile entries and dependency artifacts into `dest`
    Build {
        /// Project root
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Skip loader compaction
        #[arg(long)]
        no_minify: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(cli.verbose, cli.quiet);

    match cli.command {
        Command::Serve { root, addr } => {
            let config = AppConfig::load(&root.canonicalize()?)?;
            let app = App::new(config).await?;
            app.watch();
            server::Server::new(app, addr).start().await
        }
        Command::Build { root, no_minify } => {
            let config = AppConfig::load(&root.canonicalize()?)?;
            let app = App::new(config).await?;
            app.compile_all(!no_minify).await?;
            Ok(())
        }
    }
}
