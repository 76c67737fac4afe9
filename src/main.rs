use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "boogie")]
#[command(about = "Boogie - agent pipeline compiler and runtime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the token stream of a program
    Tokens {
        /// Program source file
        file: PathBuf,
    },
    /// Print the syntax tree of a program
    Parse {
        /// Program source file
        file: PathBuf,
    },
    /// Compile a program to bytecode
    Compile {
        /// Program source file
        file: PathBuf,
        /// Emit the JSON bytecode artifact instead of a listing
        #[arg(long)]
        json: bool,
        /// Write the output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compile and execute a program
    Run {
        /// Program source file, or a JSON artifact with --bytecode
        file: PathBuf,
        /// Runtime configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Treat FILE as compiled JSON bytecode
        #[arg(long)]
        bytecode: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Tokens { file } => commands::tokens::run(&file),
        Commands::Parse { file } => commands::parse::run(&file),
        Commands::Compile { file, json, output } => {
            commands::compile::run(&file, json, output.as_deref())
        }
        Commands::Run {
            file,
            config,
            bytecode,
        } => commands::run::run(&file, config.as_deref(), bytecode).await,
    }
}
