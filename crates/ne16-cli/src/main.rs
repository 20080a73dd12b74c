//! ne16 command-line tool
//!
//! Inspects NE images and loads them, with their dependencies, into an
//! address space backed by a stub segment host.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use output::{resolve_color_choice, StyledOutput};

#[derive(Parser)]
#[command(name = "ne16")]
#[command(about = "Inspect and load 16-bit segmented (NE) modules", long_about = None)]
#[command(version)]
struct Cli {
    /// Loader configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Color output: auto, always, never
    #[arg(long, global = true)]
    color: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the headers and tables of one image without loading dependencies
    Dump {
        /// Image file
        file: PathBuf,
    },

    /// Load modules and their dependencies
    Load {
        /// Module names or paths
        #[arg(required = true)]
        modules: Vec<String>,
        /// Extra directory to search (repeatable)
        #[arg(short = 'L', long = "search-path")]
        search_paths: Vec<PathBuf>,
        /// Directory tried for the requested modules after the search path
        #[arg(long)]
        hint: Option<PathBuf>,
        /// Export of the first module to resolve, by name or #ordinal (repeatable)
        #[arg(short, long = "proc")]
        procs: Vec<String>,
    },

    /// Exercise the arena allocator with random traffic
    Arena {
        /// Arena size in bytes
        #[arg(long)]
        capacity: Option<usize>,
        /// Number of allocate/free operations
        #[arg(long, default_value = "10000")]
        ops: usize,
        /// Largest single request in bytes
        #[arg(long, default_value = "4096")]
        max_size: usize,
        /// Random seed
        #[arg(long, default_value = "1")]
        seed: u64,
    },

    /// Show version, effective configuration and environment
    Info,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("NE16_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let mut out = StyledOutput::new(resolve_color_choice(cli.color.as_deref()));

    let result = commands::load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Dump { file } => commands::dump::execute(&mut out, &config, &file, cli.json),
        Commands::Load {
            modules,
            search_paths,
            hint,
            procs,
        } => {
            let options = commands::load::LoadOptions {
                modules,
                search_paths,
                hint,
                procs,
                json: cli.json,
            };
            commands::load::execute(&mut out, config, options)
        }
        Commands::Arena {
            capacity,
            ops,
            max_size,
            seed,
        } => {
            let options = commands::arena::ArenaOptions {
                capacity: capacity.unwrap_or(config.arena_capacity),
                split_threshold: config.split_threshold,
                ops,
                max_size,
                seed,
                json: cli.json,
            };
            commands::arena::execute(&mut out, options)
        }
        Commands::Info => commands::info::execute(&mut out, &config, cli.json),
    });

    if let Err(e) = result {
        out.stderr_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
