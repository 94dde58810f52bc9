// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::{
    fs::File,
    io::{BufWriter, Write},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use gxescan::aggregate;
use gxescan::config::{AnalysisConfig, StoreBackend};
use gxescan::dataset;
use gxescan::orchestrator;
use gxescan::types::ModelType;

// --- Main Function ---
fn main() -> Result<()> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    let analysis_config = build_config(&cli_args);
    analysis_config
        .validate()
        .context("Configuration validation failed")?;
    log_configuration(&analysis_config);

    // Stale tables from a previous run in the same directory would be
    // indistinguishable from this run's output.
    aggregate::clear_previous_results(&analysis_config.output_directory)
        .context("Failed to remove result files from a previous run")?;

    // --- 1. Load the panel ---
    let panel = dataset::load_panel(&analysis_config).context("Failed to load the dataset")?;

    // --- 2. Resolve interaction markers and significance limits ---
    let interaction_markers = match &analysis_config.marker_file {
        Some(path) => dataset::read_marker_list(path, &panel)
            .context("Failed to read the interaction-marker file")?,
        None => {
            // A single pass keyed by the interaction file itself.
            let label = analysis_config
                .interaction_file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("Interaction file path has no file name"))?;
            vec![label]
        }
    };
    if interaction_markers.is_empty() {
        return Err(anyhow!("The interaction-marker file names no markers"));
    }

    let (ap_limits, mult_limits) = match &analysis_config.limit_file {
        Some(path) => dataset::read_significance_limits(path)
            .context("Failed to read the significance-limit file")?,
        None => (Vec::new(), Vec::new()),
    };

    write_parameter_echo(&analysis_config)?;

    // --- 3. Run the pipeline ---
    info!(
        "Starting analysis: {} interaction marker(s), {} test markers, {} permutation(s)",
        interaction_markers.len(),
        panel.markers.len(),
        analysis_config.permutations
    );
    orchestrator::run(
        &analysis_config,
        &panel,
        &interaction_markers,
        ap_limits,
        mult_limits,
    )
    .context("Analysis pipeline failed")?;

    info!(
        "gxescan finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

fn build_config(cli_args: &cli::CliArgs) -> AnalysisConfig {
    let workers = cli_args.workers.unwrap_or_else(num_cpus::get).max(1);
    let seed = cli_args.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    });
    AnalysisConfig {
        dataset_base: cli_args.bfile.clone(),
        interaction_file: cli_args.interaction.clone(),
        marker_file: cli_args.marker_file.clone(),
        limit_file: cli_args.limit_file.clone(),
        output_directory: cli_args.out.clone(),
        permutations: cli_args.permutations,
        workers,
        queue_capacity: cli_args.queue_size.unwrap_or(workers * 20),
        batch_size: cli_args.batch_size,
        cell_cutoff: cli_args.cutoff,
        model_type: cli_args.model.into(),
        max_iterations: cli_args.iterations,
        convergence_threshold: cli_args.threshold,
        seed,
        store_backend: cli_args.store.into(),
        allow_negative_ap: cli_args.negative_ap,
        permutation_output: cli_args.permutation_output,
        total_permutation_output: cli_args.total_permutation_output,
    }
}

fn log_configuration(config: &AnalysisConfig) {
    info!("Data set: {}", config.dataset_base.display());
    info!("Interaction file: {}", config.interaction_file.display());
    info!("Output directory: {}", config.output_directory.display());
    info!("Data store: {}", config.store_backend);
    info!("Model type: {}", config.model_type);
    info!("Permutations: {}", config.permutations);
    info!("Seed: {}", config.seed);
    info!("Workers: {}", config.workers);
    info!("Cell cutoff: {}", config.cell_cutoff);
    info!("Solver iterations: {}", config.max_iterations);
    info!("Convergence threshold: {}", config.convergence_threshold);
}

/// Echoes the effective configuration next to the results so a directory of
/// outputs stays self-describing.
fn write_parameter_echo(config: &AnalysisConfig) -> Result<()> {
    let path = config.output_directory.join("parameters.txt");
    let mut writer = BufWriter::new(
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    writeln!(writer, "Data set: {}", config.dataset_base.display())?;
    writeln!(
        writer,
        "Interaction file: {}",
        config.interaction_file.display()
    )?;
    writeln!(
        writer,
        "Marker file: {}",
        config
            .marker_file
            .as_ref()
            .map_or_else(|| "-".to_string(), |path| path.display().to_string())
    )?;
    writeln!(
        writer,
        "Limit file: {}",
        config
            .limit_file
            .as_ref()
            .map_or_else(|| "-".to_string(), |path| path.display().to_string())
    )?;
    writeln!(writer, "Permutations: {}", config.permutations)?;
    writeln!(writer, "Model type: {}", config.model_type)?;
    writeln!(writer, "Seed: {}", config.seed)?;
    writeln!(writer, "Workers: {}", config.workers)?;
    writeln!(writer, "Cell cutoff: {}", config.cell_cutoff)?;
    writeln!(writer, "Solver iterations: {}", config.max_iterations)?;
    writeln!(
        writer,
        "Convergence threshold: {}",
        config.convergence_threshold
    )?;
    writer.flush()?;
    Ok(())
}

// --- CLI Module ---

mod cli {
    use std::path::PathBuf;

    use clap::{Parser, ValueEnum};

    use gxescan::config::{
        DEFAULT_BATCH_SIZE, DEFAULT_CELL_CUTOFF, DEFAULT_CONVERGENCE_THRESHOLD,
        DEFAULT_MAX_ITERATIONS,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
    pub(crate) enum ModelArg {
        Dominant,
        Recessive,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
    pub(crate) enum StoreArg {
        Memory,
        File,
    }

    #[derive(Parser, Debug)]
    #[command(
        author,
        version,
        about = "Gene-gene / gene-environment interaction analysis over PLINK binary genotype panels.",
        long_about = None,
        propagate_version = true
    )]
    pub(crate) struct CliArgs {
        /// Path prefix of the PLINK binary triple (<prefix>.bed/.bim/.fam).
        #[arg(short = 'b', long = "bfile", required = true)]
        pub(crate) bfile: PathBuf,

        /// Interaction-variable file (INDID / ENV / covariate columns).
        #[arg(short = 'i', long = "interaction", required = true)]
        pub(crate) interaction: PathBuf,

        /// File naming one interaction marker per line; when given, the
        /// interaction variable is derived from each listed marker.
        #[arg(short = 'm', long = "marker-file")]
        pub(crate) marker_file: Option<PathBuf>,

        /// Externally supplied significance-limit cutoffs
        /// (CUTOFF_APP / CUTOFF_MULT columns).
        #[arg(long = "limit-file")]
        pub(crate) limit_file: Option<PathBuf>,

        /// Output directory for the result tables.
        #[arg(short = 'o', long = "out", default_value = ".")]
        pub(crate) out: PathBuf,

        /// Number of label permutations (0 = unpermuted analysis only).
        #[arg(short = 'p', long, default_value_t = 0)]
        pub(crate) permutations: usize,

        /// Worker threads; defaults to the number of logical CPUs.
        #[arg(short = 't', long)]
        pub(crate) workers: Option<usize>,

        /// Capacity of the in-flight batch queue; defaults to workers * 20.
        #[arg(long)]
        pub(crate) queue_size: Option<usize>,

        /// Markers bundled into one worker task.
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        pub(crate) batch_size: usize,

        /// Minimum contingency-cell count; sparser models are skipped.
        #[arg(long, default_value_t = DEFAULT_CELL_CUTOFF)]
        pub(crate) cutoff: i64,

        /// Genetic model for risk-factor classification.
        #[arg(long, value_enum, default_value_t = ModelArg::Dominant)]
        pub(crate) model: ModelArg,

        /// Maximum IRLS iterations per fit.
        #[arg(long, default_value_t = DEFAULT_MAX_ITERATIONS)]
        pub(crate) iterations: usize,

        /// Convergence threshold on the summed absolute coefficient change.
        #[arg(long, default_value_t = DEFAULT_CONVERGENCE_THRESHOLD)]
        pub(crate) threshold: f64,

        /// Seed for the permutation shuffles; defaults to the current time.
        #[arg(short = 's', long)]
        pub(crate) seed: Option<u64>,

        /// Backend holding the genotype matrix.
        #[arg(long, value_enum, default_value_t = StoreArg::Memory)]
        pub(crate) store: StoreArg,

        /// Keep negative AP values in the permutation accumulation.
        #[arg(long)]
        pub(crate) negative_ap: bool,

        /// Write one raw results file per permutation index.
        #[arg(long)]
        pub(crate) permutation_output: bool,

        /// Write the per-permutation global-minimum table.
        #[arg(long)]
        pub(crate) total_permutation_output: bool,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}

impl From<cli::ModelArg> for ModelType {
    fn from(arg: cli::ModelArg) -> ModelType {
        match arg {
            cli::ModelArg::Dominant => ModelType::Dominant,
            cli::ModelArg::Recessive => ModelType::Recessive,
        }
    }
}

impl From<cli::StoreArg> for StoreBackend {
    fn from(arg: cli::StoreArg) -> StoreBackend {
        match arg {
            cli::StoreArg::Memory => StoreBackend::Memory,
            cli::StoreArg::File => StoreBackend::File,
        }
    }
}
