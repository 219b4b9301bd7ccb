//! Lamina CLI - builds packages into a deployable document.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod build;
mod init;

#[derive(Parser)]
#[command(name = "lamina")]
#[command(version)]
#[command(about = "Builds Lamina packages into a single document", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new Lamina package in the current directory
    Init {
        /// Set the package name (defaults to directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Build a package and its dependencies into a single document
    Build {
        /// Package name or path to build
        #[arg(default_value = ".")]
        package: String,

        /// Additional directory to search for packages (repeatable)
        #[arg(long = "package-path", value_name = "DIR")]
        package_paths: Vec<PathBuf>,

        /// Override a manifest field, e.g. --set minify=true
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Write the document to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { name } => init::init_package(name),
        Commands::Build {
            package,
            package_paths,
            overrides,
            output,
        } => build::build(&package, &package_paths, &overrides, output.as_deref()),
    }
}
