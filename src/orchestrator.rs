// Drives the permutation pipeline: one orchestrator thread batching tasks
// onto a bounded worker pool, one consumer thread draining completions in
// submission order.

use std::sync::Arc;
use std::thread;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::aggregate::{BatchHandle, OutputError, ResultConsumer};
use crate::config::AnalysisConfig;
use crate::dataset::Panel;
use crate::store::StoreError;
use crate::task::{run_batch, TaskConfig, TaskOutcome};
use crate::types::{AffectionStatus, Genotype, ModelType, Sex};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("failed to build the worker pool: {0}")]
    Pool(String),
    #[error("failed to spawn the result consumer: {0}")]
    ConsumerSpawn(std::io::Error),
    #[error("the result consumer stopped before all work was submitted")]
    ConsumerGone,
    #[error("the result consumer panicked")]
    ConsumerPanicked,
}

/// Derives a 0/1 interaction variable from an interaction marker's own
/// genotypes: the homozygote whose case/control allele ratio is larger is
/// the exposed state, heterozygotes follow the model type, missing
/// genotypes stay missing.
fn derive_interaction_variables(
    row_genotypes: &[Genotype],
    affection: &[AffectionStatus],
    model_type: ModelType,
) -> Vec<i32> {
    // Allele counts: [control primary, control secondary, case primary,
    // case secondary].
    let mut alleles = [0f64; 4];
    for (genotype, status) in row_genotypes.iter().zip(affection.iter()) {
        let offset = if *status == AffectionStatus::Affected {
            2
        } else {
            0
        };
        match genotype {
            Genotype::HomozygotePrimary => alleles[offset] += 2.0,
            Genotype::HomozygoteSecondary => alleles[offset + 1] += 2.0,
            Genotype::Heterozygote => {
                alleles[offset] += 1.0;
                alleles[offset + 1] += 1.0;
            }
            Genotype::Missing => {}
        }
    }

    let primary_ratio = alleles[2] / alleles[0];
    let secondary_ratio = alleles[3] / alleles[1];
    let risk_homozygote = if primary_ratio > secondary_ratio {
        Genotype::HomozygotePrimary
    } else {
        Genotype::HomozygoteSecondary
    };

    row_genotypes
        .iter()
        .map(|genotype| match genotype {
            Genotype::Heterozygote => i32::from(model_type == ModelType::Dominant),
            Genotype::HomozygotePrimary => i32::from(risk_homozygote == Genotype::HomozygotePrimary),
            Genotype::HomozygoteSecondary => {
                i32::from(risk_homozygote == Genotype::HomozygoteSecondary)
            }
            Genotype::Missing => -1,
        })
        .collect()
}

fn round_progress_bar(rounds: u64) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rounds ({percent}%) ETA: {eta}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    ProgressBar::new(rounds).with_style(style)
}

/// Runs the full analysis: for every interaction marker, permutation rounds
/// 0..=P are batched, submitted and queued in order; the consumer joins at
/// the end and surfaces any output error.
pub fn run(
    config: &AnalysisConfig,
    panel: &Panel,
    interaction_markers: &[String],
    ap_limits: Vec<f64>,
    mult_limits: Vec<f64>,
) -> Result<(), PipelineError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|index| format!("gxescan-worker-{}", index))
        .build()
        .map_err(|err| PipelineError::Pool(err.to_string()))?;

    // Submission-ordered FIFO of batch completion handles. Sending blocks
    // once `queue_capacity` batches are in flight; that backpressure is what
    // bounds memory.
    let (handle_tx, handle_rx) = flume::bounded::<BatchHandle>(config.queue_capacity);

    let consumer = ResultConsumer::new(config, ap_limits, mult_limits);
    let consumer_thread = thread::Builder::new()
        .name("gxescan-aggregator".to_string())
        .spawn(move || consumer.run(handle_rx))
        .map_err(PipelineError::ConsumerSpawn)?;

    let submission = submit_all_rounds(config, panel, interaction_markers, &pool, handle_tx);

    match consumer_thread.join() {
        Ok(consumer_result) => {
            // The consumer's own failure is the root cause when both sides
            // error: a dead consumer also makes submission fail.
            consumer_result?;
            submission?;
            Ok(())
        }
        Err(_) => Err(PipelineError::ConsumerPanicked),
    }
}

fn submit_all_rounds(
    config: &AnalysisConfig,
    panel: &Panel,
    interaction_markers: &[String],
    pool: &rayon::ThreadPool,
    handle_tx: flume::Sender<BatchHandle>,
) -> Result<(), PipelineError> {
    let sexes: Arc<Vec<Sex>> = Arc::new(panel.individuals.iter().map(|i| i.sex).collect());
    let original_affection: Vec<AffectionStatus> =
        panel.individuals.iter().map(|i| i.affection).collect();
    let covariates: Arc<Vec<Vec<f32>>> = Arc::new(
        if panel.individuals.iter().any(|i| !i.covariates.is_empty()) {
            panel
                .individuals
                .iter()
                .map(|i| i.covariates.clone())
                .collect()
        } else {
            Vec::new()
        },
    );
    let env_variables: Vec<i32> = panel
        .individuals
        .iter()
        .map(|i| i.interaction_variable)
        .collect();

    let rounds = (interaction_markers.len() * (config.permutations + 1)) as u64;
    let progress = round_progress_bar(rounds);

    for interaction_marker in interaction_markers {
        // Reseeding per interaction marker keeps every marker's permutation
        // sequence reproducible in isolation.
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut affection = original_affection.clone();

        let interactions: Arc<Vec<i32>> = match panel.marker_index(interaction_marker) {
            Some(index) if config.marker_file.is_some() => {
                let row = panel.store.marker_row(index)?;
                let genotypes: Vec<Genotype> = row.iter().collect();
                Arc::new(derive_interaction_variables(
                    &genotypes,
                    &original_affection,
                    config.model_type,
                ))
            }
            _ => Arc::new(env_variables.clone()),
        };
        let interaction_label: Arc<str> = Arc::from(interaction_marker.as_str());

        info!("Analyzing interaction marker {}", interaction_marker);
        for permutation in 0..=config.permutations {
            if permutation == 0 {
                debug!("Submitting unpermuted baseline round");
            } else {
                debug!(
                    "Submitting permutation {}/{}",
                    permutation, config.permutations
                );
            }
            let shared_affection = Arc::new(affection.clone());

            let marker_indices: Vec<usize> = (0..panel.markers.len()).collect();
            for batch_indices in marker_indices.chunks(config.batch_size) {
                let mut configs = Vec::with_capacity(batch_indices.len());
                for &marker_index in batch_indices {
                    let marker = &panel.markers[marker_index];
                    configs.push(TaskConfig {
                        chromosome: marker.chromosome.clone(),
                        marker: marker.id.clone(),
                        interaction_marker: Arc::clone(&interaction_label),
                        genotypes: panel.store.marker_row(marker_index)?,
                        sexes: Arc::clone(&sexes),
                        affection: Arc::clone(&shared_affection),
                        interactions: Arc::clone(&interactions),
                        covariates: Arc::clone(&covariates),
                        primary_allele: marker.primary_allele,
                        secondary_allele: marker.secondary_allele,
                        permutation,
                        cell_cutoff: config.cell_cutoff,
                        model_type: config.model_type,
                        max_iterations: config.max_iterations,
                        convergence_threshold: config.convergence_threshold,
                    });
                }
                if configs.is_empty() {
                    continue;
                }

                let (result_tx, result_rx) = flume::bounded::<Vec<TaskOutcome>>(1);
                pool.spawn(move || {
                    let _ = result_tx.send(run_batch(configs));
                });
                handle_tx
                    .send(result_rx)
                    .map_err(|_| PipelineError::ConsumerGone)?;
            }

            // Shuffle after submitting round p; round p+1 sees the new
            // label assignment.
            affection.shuffle(&mut rng);
            progress.inc(1);
        }
    }
    progress.finish_with_message("All permutation rounds submitted");
    Ok(())
}
