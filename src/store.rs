// Marker-major genotype storage.
//
// Both backends pack four genotypes per byte, two bits each, with the lowest
// individual index in the lowest bits, so a marker's record is bit-identical
// regardless of which backend produced it. Records are `(n_individuals - 1) /
// 4 + 1` bytes long and laid out consecutively in marker order.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use log::debug;
use thiserror::Error;

use crate::types::Genotype;

/// Genotypes packed per byte.
pub const GENOTYPE_DENSITY: usize = 4;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("genotype index out of bounds: individual {individual}/{individual_count}, marker {marker}/{marker_count}")]
    OutOfBounds {
        individual: usize,
        marker: usize,
        individual_count: usize,
        marker_count: usize,
    },
    #[error("genotype cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Random-access genotype matrix, written once during load and read-only
/// during analysis.
pub trait GenotypeStore: Send + Sync {
    fn individual_count(&self) -> usize;

    fn marker_count(&self) -> usize;

    fn genotype_at(&self, individual: usize, marker: usize) -> Result<Genotype, StoreError>;

    fn set_genotype(
        &mut self,
        individual: usize,
        marker: usize,
        genotype: Genotype,
    ) -> Result<(), StoreError>;

    /// The full packed record for one marker, one genotype per individual in
    /// load order.
    fn marker_row(&self, marker: usize) -> Result<MarkerRow, StoreError>;
}

/// One marker's genotypes in individual order. `iter` starts a fresh pass
/// over the record every time it is called.
#[derive(Debug, Clone)]
pub struct MarkerRow {
    data: Vec<u8>,
    len: usize,
}

impl MarkerRow {
    pub fn new(data: Vec<u8>, len: usize) -> MarkerRow {
        debug_assert!(data.len() * GENOTYPE_DENSITY >= len);
        MarkerRow { data, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn genotype(&self, index: usize) -> Genotype {
        let byte = self.data[index / GENOTYPE_DENSITY];
        Genotype::from_code(byte >> ((index % GENOTYPE_DENSITY) * 2))
    }

    pub fn iter(&self) -> impl Iterator<Item = Genotype> + '_ {
        (0..self.len).map(move |index| self.genotype(index))
    }
}

#[inline]
fn record_size(individual_count: usize) -> usize {
    (individual_count + GENOTYPE_DENSITY - 1) / GENOTYPE_DENSITY
}

#[inline]
fn packed_position(entry_size: usize, individual: usize, marker: usize) -> (usize, u32) {
    let byte_index = entry_size * marker + individual / GENOTYPE_DENSITY;
    let shift = ((individual % GENOTYPE_DENSITY) * 2) as u32;
    (byte_index, shift)
}

#[inline]
fn splice_genotype(byte: u8, shift: u32, genotype: Genotype) -> u8 {
    (byte & !(0x3 << shift)) | (genotype.code() << shift)
}

fn check_bounds(
    individual: usize,
    marker: usize,
    individual_count: usize,
    marker_count: usize,
) -> Result<(), StoreError> {
    if individual >= individual_count || marker >= marker_count {
        return Err(StoreError::OutOfBounds {
            individual,
            marker,
            individual_count,
            marker_count,
        });
    }
    Ok(())
}

/// In-process backend: the whole matrix lives in one contiguous buffer.
pub struct MemoryStore {
    genotypes: Vec<u8>,
    entry_size: usize,
    individual_count: usize,
    marker_count: usize,
}

impl MemoryStore {
    pub fn new(individual_count: usize, marker_count: usize) -> MemoryStore {
        let entry_size = record_size(individual_count);
        debug!(
            "Allocating in-memory genotype store: {} markers x {} bytes",
            marker_count, entry_size
        );
        MemoryStore {
            genotypes: vec![0u8; entry_size * marker_count],
            entry_size,
            individual_count,
            marker_count,
        }
    }
}

impl GenotypeStore for MemoryStore {
    fn individual_count(&self) -> usize {
        self.individual_count
    }

    fn marker_count(&self) -> usize {
        self.marker_count
    }

    fn genotype_at(&self, individual: usize, marker: usize) -> Result<Genotype, StoreError> {
        check_bounds(individual, marker, self.individual_count, self.marker_count)?;
        let (byte_index, shift) = packed_position(self.entry_size, individual, marker);
        Ok(Genotype::from_code(self.genotypes[byte_index] >> shift))
    }

    fn set_genotype(
        &mut self,
        individual: usize,
        marker: usize,
        genotype: Genotype,
    ) -> Result<(), StoreError> {
        check_bounds(individual, marker, self.individual_count, self.marker_count)?;
        let (byte_index, shift) = packed_position(self.entry_size, individual, marker);
        self.genotypes[byte_index] = splice_genotype(self.genotypes[byte_index], shift, genotype);
        Ok(())
    }

    fn marker_row(&self, marker: usize) -> Result<MarkerRow, StoreError> {
        check_bounds(0, marker, self.individual_count.max(1), self.marker_count)?;
        let start = self.entry_size * marker;
        let data = self.genotypes[start..start + self.entry_size].to_vec();
        Ok(MarkerRow::new(data, self.individual_count))
    }
}

/// File backend: the matrix lives in an anonymous temporary file that the
/// operating system reclaims when the process exits. Useful when the panel
/// does not fit in memory; access cost is one seek per touched byte.
pub struct FileStore {
    file: Mutex<File>,
    entry_size: usize,
    individual_count: usize,
    marker_count: usize,
}

impl FileStore {
    pub fn new(individual_count: usize, marker_count: usize) -> Result<FileStore, StoreError> {
        let entry_size = record_size(individual_count);
        let file = tempfile::tempfile()?;
        file.set_len((entry_size * marker_count) as u64)?;
        debug!(
            "Created file-backed genotype store: {} markers x {} bytes",
            marker_count, entry_size
        );
        Ok(FileStore {
            file: Mutex::new(file),
            entry_size,
            individual_count,
            marker_count,
        })
    }
}

impl GenotypeStore for FileStore {
    fn individual_count(&self) -> usize {
        self.individual_count
    }

    fn marker_count(&self) -> usize {
        self.marker_count
    }

    fn genotype_at(&self, individual: usize, marker: usize) -> Result<Genotype, StoreError> {
        check_bounds(individual, marker, self.individual_count, self.marker_count)?;
        let (byte_index, shift) = packed_position(self.entry_size, individual, marker);
        let mut file = self.file.lock().expect("genotype store lock poisoned");
        file.seek(SeekFrom::Start(byte_index as u64))?;
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf)?;
        Ok(Genotype::from_code(buf[0] >> shift))
    }

    fn set_genotype(
        &mut self,
        individual: usize,
        marker: usize,
        genotype: Genotype,
    ) -> Result<(), StoreError> {
        check_bounds(individual, marker, self.individual_count, self.marker_count)?;
        let (byte_index, shift) = packed_position(self.entry_size, individual, marker);
        let file = self.file.get_mut().expect("genotype store lock poisoned");
        file.seek(SeekFrom::Start(byte_index as u64))?;
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf)?;
        buf[0] = splice_genotype(buf[0], shift, genotype);
        file.seek(SeekFrom::Start(byte_index as u64))?;
        file.write_all(&buf)?;
        Ok(())
    }

    fn marker_row(&self, marker: usize) -> Result<MarkerRow, StoreError> {
        check_bounds(0, marker, self.individual_count.max(1), self.marker_count)?;
        let mut data = vec![0u8; self.entry_size];
        let mut file = self.file.lock().expect("genotype store lock poisoned");
        file.seek(SeekFrom::Start((self.entry_size * marker) as u64))?;
        file.read_exact(&mut data)?;
        Ok(MarkerRow::new(data, self.individual_count))
    }
}
