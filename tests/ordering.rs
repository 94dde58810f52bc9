// The consumer must pair every permuted result with a fully materialized
// baseline even when workers finish wildly out of order. Batches are handed
// to the consumer through the submission-ordered handle queue while worker
// threads sleep for staggered times before publishing their results.

mod common;

use std::thread;
use std::time::Duration;

use common::{fixture_config, read_output};
use gxescan::aggregate::{BatchHandle, ResultConsumer};
use gxescan::task::{ResultColumn, ResultRow, TaskOutcome};

const MARKERS: [&str; 3] = ["rs1", "rs2", "rs3"];
const BASELINE_APP: [f64; 3] = [0.2, 0.05, 0.9];
// Permuted AP p-values per round; hits are values at or below the baseline.
const PERMUTED_APP: [[f64; 3]; 3] = [
    [0.1, 0.01, 1.0],  // hits: rs1, rs2
    [0.3, 0.05, 0.8],  // hits: rs2, rs3
    [0.25, 0.5, 0.9],  // hits: rs3
];
const EXPECTED_P: [f64; 3] = [1.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0];

fn synthetic_row(marker: &str, permutation: usize, app: f64) -> ResultRow {
    let mut row = ResultRow::default();
    row.set(ResultColumn::Perm, permutation.to_string());
    row.set(ResultColumn::Interaction, "ENV");
    row.set(ResultColumn::Chr, "1");
    row.set(ResultColumn::Snp, marker);
    row.set(ResultColumn::StableAdditive, "Y");
    row.set(ResultColumn::StableMultiplicative, "Y");
    row.set(ResultColumn::Ap, "0.1");
    row.set(ResultColumn::ApPValue, app.to_string());
    row.set(ResultColumn::MultPValue, "0.5");
    row.set(ResultColumn::Threshold, "0.001");
    row
}

#[test]
fn delayed_workers_still_pair_results_with_their_baselines() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture_config(dir.path(), 3, 0);
    let consumer = ResultConsumer::new(&config, Vec::new(), Vec::new());

    let (handle_tx, handle_rx) = flume::bounded::<BatchHandle>(8);
    let consumer_thread = thread::spawn(move || consumer.run(handle_rx));

    // The baseline batch is submitted first but finishes LAST; later
    // permutations complete almost immediately.
    let delays_ms: [u64; 4] = [120, 0, 40, 10];
    let mut workers = Vec::new();
    for (permutation, &delay) in delays_ms.iter().enumerate() {
        let (result_tx, result_rx) = flume::bounded::<Vec<TaskOutcome>>(1);
        let batch: Vec<TaskOutcome> = MARKERS
            .iter()
            .enumerate()
            .map(|(index, marker)| {
                let app = if permutation == 0 {
                    BASELINE_APP[index]
                } else {
                    PERMUTED_APP[permutation - 1][index]
                };
                Ok(synthetic_row(marker, permutation, app))
            })
            .collect();
        workers.push(thread::spawn(move || {
            thread::sleep(Duration::from_millis(delay));
            let _ = result_tx.send(batch);
        }));
        handle_tx.send(result_rx).unwrap();
    }
    drop(handle_tx);

    for worker in workers {
        worker.join().unwrap();
    }
    consumer_thread.join().unwrap().unwrap();

    let table = read_output(dir.path(), "marker_permutation_results.txt");
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines.len(), 1 + MARKERS.len());

    for (index, marker) in MARKERS.iter().enumerate() {
        let cells: Vec<&str> = lines[1 + index].split('\t').collect();
        assert_eq!(cells[0], "ENV");
        assert_eq!(cells[1], *marker);
        // Column 11 is the AP empirical p-value.
        let p: f64 = cells[11].parse().unwrap();
        assert!(
            (p - EXPECTED_P[index]).abs() < 1e-12,
            "marker {} expected p {} got {}",
            marker,
            EXPECTED_P[index],
            p
        );
        // Every permuted fit was stable.
        assert_eq!(cells[12], "1");
        assert_eq!(cells[14], "1");
    }

    // The baseline rows landed in the primary table exactly once each.
    let results = read_output(dir.path(), "results.txt");
    assert_eq!(results.lines().count(), 1 + MARKERS.len());
}
