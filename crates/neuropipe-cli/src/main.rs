use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

use commands::Format;
use commands::populate::PopulateArgs;

#[derive(Parser)]
#[command(
    name = "neuropipe",
    about = "neuropipe: reproducible neuroscience pipelines",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Pipeline manifest
    #[arg(short, long, global = true, default_value = "neuropipe.toml")]
    config: PathBuf,
    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text", value_parser = ["text", "json"])]
    format: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter manifest and a sample entries file
    Init {
        /// Pipeline name, also used for the database file
        #[arg(short, long, default_value = "neuropipe")]
        name: String,
        /// Overwrite an existing manifest
        #[arg(long)]
        force: bool,
    },
    /// Compute the missing keys of one table.
    ///
    /// Per-key failures are printed and recorded; the command still
    /// succeeds. Only structural errors (unknown table, bad restriction,
    /// storage) exit non-zero.
    Populate {
        table: String,
        #[command(flatten)]
        args: PopulateArgs,
    },
    /// Populate every table downstream of --from, or the whole pipeline
    PopulateAll {
        /// Start at this table instead of the pipeline roots
        #[arg(long)]
        from: Option<String>,
        #[command(flatten)]
        args: PopulateArgs,
    },
    /// Delete rows matching a (partial) key and everything derived from them.
    ///
    /// Exits non-zero when a running job holds an affected key.
    Delete {
        table: String,
        /// Key as name=value pairs, e.g. session_id=1
        key: String,
        /// Print the plan without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Insert one row into a manual or lookup table
    Insert {
        table: String,
        /// Row as name=value pairs, e.g. session_id=3,subject=rat3
        row: String,
        /// Skip the row instead of failing when its key exists
        #[arg(long)]
        skip_duplicates: bool,
    },
    /// Apply a TOML entries file to manual and lookup tables
    Prepopulate { file: PathBuf },
    /// Show the lineage of one row
    Provenance { table: String, key: String },
    /// Drop the row-set committed for one candidate key so it is recomputed
    Invalidate { table: String, key: String },
    /// List reserved and ignored jobs
    Jobs { table: Option<String> },
    /// List failed keys
    Failures {
        table: Option<String>,
        /// Remove the listed failure records
        #[arg(long)]
        clear: bool,
    },
    /// Exclude a candidate key from populate
    Ignore {
        table: String,
        key: String,
        /// Lift the exclusion instead
        #[arg(long)]
        clear: bool,
    },
    /// Turn abandoned reservations into failure records
    Recover,
    /// Row counts and populate progress per table
    Status,
    /// Tables in dependency order
    Graph,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("neuropipe=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = Format::parse(&cli.format);

    if let Commands::Init { name, force } = &cli.command {
        return commands::init::init(&cli.config, name, *force);
    }

    let pipeline = commands::open(&cli.config)?;
    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Populate { table, args } => {
            commands::populate::populate(&pipeline, &table, &args, format).await
        }
        Commands::PopulateAll { from, args } => {
            commands::populate::populate_all(&pipeline, from.as_deref(), &args, format).await
        }
        Commands::Delete { table, key, dry_run } => {
            commands::delete::delete(&pipeline, &table, &key, dry_run, format)
        }
        Commands::Insert {
            table,
            row,
            skip_duplicates,
        } => commands::ingest::insert(&pipeline, &table, &row, skip_duplicates, format),
        Commands::Prepopulate { file } => commands::ingest::prepopulate(&pipeline, &file, format),
        Commands::Provenance { table, key } => {
            commands::audit::provenance(&pipeline, &table, &key, format)
        }
        Commands::Invalidate { table, key } => {
            commands::delete::invalidate(&pipeline, &table, &key, format)
        }
        Commands::Jobs { table } => commands::audit::jobs(&pipeline, table.as_deref(), format),
        Commands::Failures { table, clear } => {
            commands::audit::failures(&pipeline, table.as_deref(), clear, format)
        }
        Commands::Ignore { table, key, clear } => {
            commands::audit::ignore(&pipeline, &table, &key, clear, format)
        }
        Commands::Recover => commands::audit::recover(&pipeline, format),
        Commands::Status => commands::audit::status(&pipeline, format),
        Commands::Graph => commands::audit::graph(&pipeline, format),
    }
}
