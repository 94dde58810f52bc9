// Shared fixtures: writes a small PLINK binary triple plus an interaction
// file into a scratch directory and assembles a matching run configuration.
#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use gxescan::config::{AnalysisConfig, StoreBackend};
use gxescan::types::{Genotype, ModelType};

pub struct FixtureIndividual {
    pub id: String,
    pub sex: i32,
    pub phenotype: i32,
    pub env: i32,
}

pub struct FixtureMarker {
    pub id: String,
    pub chromosome: String,
    pub allele_1: char,
    pub allele_2: char,
    /// One genotype per individual, in order.
    pub genotypes: Vec<Genotype>,
}

/// Writes `<dir>/panel.bed/.bim/.fam` (marker-major layout) and
/// `<dir>/interaction.txt`.
pub fn write_panel(dir: &Path, individuals: &[FixtureIndividual], markers: &[FixtureMarker]) {
    let base = dir.join("panel");

    let mut fam = File::create(base.with_extension("fam")).unwrap();
    for (index, individual) in individuals.iter().enumerate() {
        writeln!(
            fam,
            "F{} {} 0 0 {} {}",
            index, individual.id, individual.sex, individual.phenotype
        )
        .unwrap();
    }

    let mut bim = File::create(base.with_extension("bim")).unwrap();
    for (index, marker) in markers.iter().enumerate() {
        writeln!(
            bim,
            "{}\t{}\t0\t{}\t{}\t{}",
            marker.chromosome,
            marker.id,
            1000 + index,
            marker.allele_1,
            marker.allele_2
        )
        .unwrap();
    }

    // Genotype codes in the .bed stream are exactly the store's 2-bit codes.
    let mut bed = File::create(base.with_extension("bed")).unwrap();
    let mut bytes: Vec<u8> = vec![0x6c, 0x1b, 0x01];
    for marker in markers {
        assert_eq!(marker.genotypes.len(), individuals.len());
        let record_len = individuals.len().div_ceil(4);
        let mut record = vec![0u8; record_len];
        for (index, genotype) in marker.genotypes.iter().enumerate() {
            record[index / 4] |= genotype.code() << ((index % 4) * 2);
        }
        bytes.extend_from_slice(&record);
    }
    bed.write_all(&bytes).unwrap();

    let mut interaction = File::create(dir.join("interaction.txt")).unwrap();
    writeln!(interaction, "INDID ENV").unwrap();
    for individual in individuals {
        let env = if individual.env < 0 {
            "NA".to_string()
        } else {
            individual.env.to_string()
        };
        writeln!(interaction, "{} {}", individual.id, env).unwrap();
    }
}

pub fn fixture_config(dir: &Path, permutations: usize, seed: u64) -> AnalysisConfig {
    AnalysisConfig {
        dataset_base: dir.join("panel"),
        interaction_file: dir.join("interaction.txt"),
        marker_file: None,
        limit_file: None,
        output_directory: dir.to_path_buf(),
        permutations,
        workers: 2,
        queue_capacity: 8,
        batch_size: 1,
        cell_cutoff: 0,
        model_type: ModelType::Dominant,
        max_iterations: 500,
        convergence_threshold: 1e-3,
        seed,
        store_backend: StoreBackend::Memory,
        allow_negative_ap: true,
        permutation_output: false,
        total_permutation_output: false,
    }
}

/// 40 individuals: the first half unexposed, the second half exposed, cases
/// alternating with controls so every genotype-by-exposure group holds both.
pub fn forty_individuals() -> Vec<FixtureIndividual> {
    (0..40)
        .map(|index| FixtureIndividual {
            id: format!("ind{}", index),
            sex: 2,
            phenotype: if index % 2 == 0 { 2 } else { 1 },
            env: i32::from(index >= 20),
        })
        .collect()
}

// 7 primary homozygotes, 6 heterozygotes, 7 secondary homozygotes.
fn genotype_mix() -> Vec<Genotype> {
    let mut mix = vec![Genotype::HomozygotePrimary; 7];
    mix.extend(vec![Genotype::Heterozygote; 6]);
    mix.extend(vec![Genotype::HomozygoteSecondary; 7]);
    mix
}

/// `rs1` carries all three genotype states in both exposure halves, so every
/// contingency cell stays populated whichever allele is called the risk
/// allele. `rs2`'s carriers all sit in the unexposed half, leaving an
/// exposure cell structurally empty under either orientation.
pub fn two_markers() -> Vec<FixtureMarker> {
    let mut healthy = genotype_mix();
    healthy.extend(genotype_mix());

    let mut degenerate = vec![Genotype::HomozygotePrimary; 40];
    for slot in degenerate.iter_mut().take(10) {
        *slot = Genotype::Heterozygote;
    }

    vec![
        FixtureMarker {
            id: "rs1".to_string(),
            chromosome: "1".to_string(),
            allele_1: 'A',
            allele_2: 'G',
            genotypes: healthy,
        },
        FixtureMarker {
            id: "rs2".to_string(),
            chromosome: "1".to_string(),
            allele_1: 'A',
            allele_2: 'G',
            genotypes: degenerate,
        },
    ]
}

pub fn read_output(dir: &Path, name: &str) -> String {
    std::fs::read_to_string(dir.join(name)).unwrap()
}

pub fn output_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}
