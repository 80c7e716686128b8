use anyhow::Result;
use bench_compare::DecimalSeparator;
use bench_runner::CampaignSpec;
use bench_store::Store;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pnbench", version, about = "Benchmark campaigns for Petri net analysis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    #[value(name = "bpn")]
    Bpn,
    #[value(name = "pnml")]
    Pnml,
    #[value(name = "prod")]
    Prod,
    #[value(name = "tina")]
    Tina,
}

impl FormatArg {
    fn as_str(self) -> &'static str {
        match self {
            FormatArg::Bpn => "bpn",
            FormatArg::Pnml => "pnml",
            FormatArg::Prod => "prod",
            FormatArg::Tina => "tina",
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SeparatorArg {
    #[value(name = "point")]
    Point,
    #[value(name = "comma")]
    Comma,
}

impl From<SeparatorArg> for DecimalSeparator {
    fn from(value: SeparatorArg) -> Self {
        match value {
            SeparatorArg::Point => DecimalSeparator::Point,
            SeparatorArg::Comma => DecimalSeparator::Comma,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register every model file found under a directory.
    AddModels {
        database: PathBuf,
        #[arg(long, value_enum)]
        format: FormatArg,
        directory: PathBuf,
    },
    /// Run the analysis tool on every registered model.
    Launch {
        database: PathBuf,
        name: String,
        tool: PathBuf,
        output_dir: PathBuf,
        #[arg(long, default_value_t = 600)]
        time_limit: u64,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long)]
        order_dir: Option<PathBuf>,
        /// Extra options handed to the tool verbatim, after `--`.
        #[arg(last = true)]
        options: Vec<String>,
    },
    /// Normalize a campaign output tree and persist it.
    Ingest {
        database: PathBuf,
        directory: PathBuf,
    },
    /// Compare selected runs and write the ranking table.
    Compare {
        database: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, value_enum, default_value = "point")]
        decimal: SeparatorArg,
        #[arg(required = true)]
        run_ids: Vec<i64>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    run_command(Cli::parse().command)
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::AddModels {
            database,
            format,
            directory,
        } => {
            let store = Store::open(&database)?;
            let summary = store.import_models(&directory, format.as_str())?;
            info!(
                added = summary.added,
                duplicates = summary.duplicates,
                ignored = summary.ignored,
                "models imported"
            );
            Ok(())
        }
        Commands::Launch {
            database,
            name,
            tool,
            output_dir,
            time_limit,
            workers,
            order_dir,
            options,
        } => {
            let mut store = Store::open(&database)?;
            let spec = CampaignSpec {
                name,
                tool,
                output_dir,
                options,
                time_limit,
                workers,
                order_dir,
            };
            let outcome = bench_runner::run_campaign(&store, &spec)?;
            let summary = bench_ingest::ingest_campaign(&mut store, &outcome.output_dir)?;
            info!(run_id = summary.run_id, "campaign recorded");
            Ok(())
        }
        Commands::Ingest {
            database,
            directory,
        } => {
            let mut store = Store::open(&database)?;
            bench_ingest::ingest_campaign(&mut store, &directory)?;
            Ok(())
        }
        Commands::Compare {
            database,
            out,
            decimal,
            run_ids,
        } => {
            let store = Store::open(&database)?;
            let comparison = bench_compare::compare(&store, &run_ids)?;
            bench_compare::write_csv(&comparison, &out, decimal.into())?;
            info!(
                runs = comparison.run_names.len(),
                models = comparison.rows.len(),
                out = %out.display(),
                "comparison written"
            );
            Ok(())
        }
    }
}
