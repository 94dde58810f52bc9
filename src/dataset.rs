// Loading of the PLINK binary triple plus the interaction-variable sidecar
// files into the in-process data model.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use bed_reader::{Bed, ReadOptions};
use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{AnalysisConfig, StoreBackend};
use crate::store::{FileStore, GenotypeStore, MemoryStore, StoreError};
use crate::types::{AffectionStatus, Allele, Genotype, Individual, Marker, Sex};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("PLINK read error: {0}")]
    Bed(#[from] Box<bed_reader::BedErrorPlus>),
    #[error("genotype store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("interaction file is missing the required {0} header column")]
    MissingHeaderColumn(&'static str),
    #[error("unparsable value '{value}' on line {line} of {path}")]
    BadValue {
        value: String,
        line: usize,
        path: String,
    },
    #[error("individuals {missing} of {total} have no covariate row in the interaction file")]
    CovariateMismatch { missing: usize, total: usize },
    #[error("interaction marker '{0}' is not present in the dataset")]
    UnknownInteractionMarker(String),
    #[error("no interaction variable: the interaction file has no ENV column and no marker file was given")]
    MissingInteractionVariables,
}

/// The loaded panel: individual and marker tables, id lookups, and the
/// populated genotype store.
pub struct Panel {
    pub individuals: Vec<Individual>,
    pub markers: Vec<Marker>,
    marker_indices: HashMap<String, usize>,
    individual_indices: HashMap<String, usize>,
    pub store: Box<dyn GenotypeStore>,
    /// Whether the interaction file carried an ENV column.
    pub has_env_variable: bool,
}

impl Panel {
    pub fn marker_index(&self, id: &str) -> Option<usize> {
        self.marker_indices.get(id).copied()
    }

    pub fn individual_index(&self, id: &str) -> Option<usize> {
        self.individual_indices.get(id).copied()
    }
}

/// Loads `<base>.bed/.bim/.fam`, applies the interaction file, and populates
/// the configured store backend through the 2-bit packing contract.
pub fn load_panel(config: &AnalysisConfig) -> Result<Panel, DatasetError> {
    let bed_path = config.dataset_base.with_extension("bed");
    info!("Loading PLINK dataset {}", bed_path.display());
    let mut bed = Bed::new(&bed_path)?;

    let mut individuals = read_individuals(&mut bed)?;
    let markers = read_markers(&mut bed)?;
    info!(
        "Loaded {} individuals and {} markers",
        individuals.len(),
        markers.len()
    );

    let has_env_variable = apply_interaction_file(&mut individuals, &config.interaction_file)?;
    if !has_env_variable && config.marker_file.is_none() {
        return Err(DatasetError::MissingInteractionVariables);
    }

    let mut store: Box<dyn GenotypeStore> = match config.store_backend {
        StoreBackend::Memory => Box::new(MemoryStore::new(individuals.len(), markers.len())),
        StoreBackend::File => Box::new(FileStore::new(individuals.len(), markers.len())?),
    };
    load_genotypes(&mut bed, store.as_mut(), individuals.len(), markers.len())?;

    let marker_indices = markers
        .iter()
        .enumerate()
        .map(|(index, marker)| (marker.id.clone(), index))
        .collect();
    let individual_indices = individuals
        .iter()
        .enumerate()
        .map(|(index, individual)| (individual.id.clone(), index))
        .collect();

    Ok(Panel {
        individuals,
        markers,
        marker_indices,
        individual_indices,
        store,
        has_env_variable,
    })
}

fn read_individuals(bed: &mut Bed) -> Result<Vec<Individual>, DatasetError> {
    let iids = bed.iid()?.to_owned();
    let sexes = bed.sex()?.to_owned();
    let phenotypes = bed.pheno()?.to_owned();

    let individuals = iids
        .iter()
        .enumerate()
        .map(|(index, iid)| {
            let sex = Sex::from_code(sexes[index]);
            let affection = AffectionStatus::from_code(parse_phenotype(&phenotypes[index]));
            Individual::new(iid.clone(), sex, affection)
        })
        .collect();
    Ok(individuals)
}

// FAM phenotypes arrive as strings; anything that is not exactly 1 or 2 is a
// missing affection status.
fn parse_phenotype(raw: &str) -> i32 {
    match raw.trim().parse::<f64>() {
        Ok(value) if value == 1.0 => 1,
        Ok(value) if value == 2.0 => 2,
        _ => 0,
    }
}

fn read_markers(bed: &mut Bed) -> Result<Vec<Marker>, DatasetError> {
    let sids = bed.sid()?.to_owned();
    let chromosomes = bed.chromosome()?.to_owned();
    let cm_positions = bed.cm_position()?.to_owned();
    let bp_positions = bed.bp_position()?.to_owned();
    let primary = bed.allele_1()?.to_owned();
    let secondary = bed.allele_2()?.to_owned();

    let markers = sids
        .iter()
        .enumerate()
        .map(|(index, sid)| Marker {
            id: sid.clone(),
            chromosome: chromosomes[index].clone(),
            position_cm: cm_positions[index],
            position_bp: bp_positions[index],
            primary_allele: Allele::from_symbol(&primary[index]),
            secondary_allele: Allele::from_symbol(&secondary[index]),
        })
        .collect();
    Ok(markers)
}

fn load_genotypes(
    bed: &mut Bed,
    store: &mut dyn GenotypeStore,
    individual_count: usize,
    marker_count: usize,
) -> Result<(), DatasetError> {
    for marker in 0..marker_count {
        let column: ndarray::Array2<i8> = ReadOptions::builder()
            .sid_index(marker as isize)
            .i8()
            .count_a1()
            .read(&mut *bed)?;
        for individual in 0..individual_count {
            let genotype = match column[[individual, 0]] {
                2 => Genotype::HomozygotePrimary,
                1 => Genotype::Heterozygote,
                0 => Genotype::HomozygoteSecondary,
                _ => Genotype::Missing,
            };
            store.set_genotype(individual, marker, genotype)?;
        }
    }
    debug!("Genotype store populated ({} markers)", marker_count);
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> DatasetError {
    DatasetError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Applies the interaction-variable file: a whitespace-delimited table whose
/// header names an `INDID` column (required), an `ENV` column (optional
/// interaction variable) and any number of covariate columns. Returns whether
/// the ENV column was present.
pub fn apply_interaction_file(
    individuals: &mut [Individual],
    path: &Path,
) -> Result<bool, DatasetError> {
    let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let mut lines = content.lines().enumerate();

    let (_, header) = lines
        .next()
        .ok_or(DatasetError::MissingHeaderColumn("INDID"))?;
    let mut id_column = None;
    let mut env_column = None;
    for (column, token) in header.split_whitespace().enumerate() {
        if token.eq_ignore_ascii_case("INDID") {
            id_column = Some(column);
        } else if token.eq_ignore_ascii_case("ENV") {
            env_column = Some(column);
        }
    }
    let id_column = id_column.ok_or(DatasetError::MissingHeaderColumn("INDID"))?;

    let indices: HashMap<String, usize> = individuals
        .iter()
        .enumerate()
        .map(|(index, individual)| (individual.id.clone(), index))
        .collect();

    let mut matched = 0usize;
    let mut covariate_width: Option<usize> = None;
    for (line_number, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let mut id = None;
        let mut variable = -1i32;
        let mut covariates = Vec::new();
        for (column, token) in line.split_whitespace().enumerate() {
            if column == id_column {
                id = Some(token);
            } else if Some(column) == env_column {
                let value: i32 = parse_na_int(token).ok_or_else(|| DatasetError::BadValue {
                    value: token.to_string(),
                    line: line_number + 1,
                    path: path.display().to_string(),
                })?;
                variable = value.signum();
            } else {
                let value: f32 = parse_na_float(token).ok_or_else(|| DatasetError::BadValue {
                    value: token.to_string(),
                    line: line_number + 1,
                    path: path.display().to_string(),
                })?;
                covariates.push(value);
            }
        }

        let Some(id) = id else { continue };
        match indices.get(id) {
            Some(&index) => {
                matched += 1;
                match covariate_width {
                    Some(width) if width != covariates.len() => {
                        return Err(DatasetError::BadValue {
                            value: format!("{} covariate columns", covariates.len()),
                            line: line_number + 1,
                            path: path.display().to_string(),
                        });
                    }
                    None => covariate_width = Some(covariates.len()),
                    _ => {}
                }
                individuals[index].interaction_variable = variable;
                individuals[index].covariates = covariates;
            }
            None => {
                warn!("Interaction file row for unknown individual '{}' ignored", id);
            }
        }
    }

    // Covariate models need a value for every individual; a partial table
    // would silently misalign the design matrices.
    if covariate_width.unwrap_or(0) > 0 && matched < individuals.len() {
        return Err(DatasetError::CovariateMismatch {
            missing: individuals.len() - matched,
            total: individuals.len(),
        });
    }
    Ok(env_column.is_some())
}

fn parse_na_int(token: &str) -> Option<i32> {
    if token.eq_ignore_ascii_case("NA") {
        Some(-1)
    } else {
        token.parse().ok()
    }
}

fn parse_na_float(token: &str) -> Option<f32> {
    if token.eq_ignore_ascii_case("NA") {
        Some(0.0)
    } else {
        token.parse().ok()
    }
}

/// Reads the interaction-marker list: one marker id per line, blanks skipped.
/// Every listed id must exist in the panel.
pub fn read_marker_list(path: &Path, panel: &Panel) -> Result<Vec<String>, DatasetError> {
    let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let mut markers = Vec::new();
    for line in content.lines() {
        let id = line.trim();
        if id.is_empty() {
            continue;
        }
        if panel.marker_index(id).is_none() {
            return Err(DatasetError::UnknownInteractionMarker(id.to_string()));
        }
        markers.push(id.to_string());
    }
    Ok(markers)
}

/// Reads externally supplied significance-limit cutoffs. The header is
/// scanned case-insensitively for `CUTOFF_APP` and `CUTOFF_MULT` columns.
pub fn read_significance_limits(path: &Path) -> Result<(Vec<f64>, Vec<f64>), DatasetError> {
    let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let mut lines = content.lines().enumerate();

    let mut ap_column = None;
    let mut mult_column = None;
    if let Some((_, header)) = lines.next() {
        for (column, token) in header.split_whitespace().enumerate() {
            if token.eq_ignore_ascii_case("CUTOFF_APP") {
                ap_column = Some(column);
            } else if token.eq_ignore_ascii_case("CUTOFF_MULT") {
                mult_column = Some(column);
            }
        }
    }

    let mut ap_limits = Vec::new();
    let mut mult_limits = Vec::new();
    for (line_number, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        for (column, token) in line.split_whitespace().enumerate() {
            if Some(column) == ap_column || Some(column) == mult_column {
                let value: f64 = token.parse().map_err(|_| DatasetError::BadValue {
                    value: token.to_string(),
                    line: line_number + 1,
                    path: path.display().to_string(),
                })?;
                if Some(column) == ap_column {
                    ap_limits.push(value);
                } else {
                    mult_limits.push(value);
                }
            }
        }
    }
    Ok((ap_limits, mult_limits))
}
