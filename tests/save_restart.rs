use std::time::Duration;
use topolenum::{Config, PairHistogram, Topology};
use test_log::test;

/// Six leaves whose true tree is (((a,b),c),(d,(e,f))), with every pair
/// also carrying a weaker off-by-one distance so the search has real
/// branching to chew through.
fn six_leaves() -> Vec<PairHistogram> {
    let true_distances = [
        (("a", "b"), 1),
        (("a", "c"), 2),
        (("b", "c"), 2),
        (("e", "f"), 1),
        (("d", "e"), 2),
        (("d", "f"), 2),
        (("a", "d"), 4),
        (("b", "d"), 4),
        (("c", "d"), 3),
        (("a", "e"), 5),
        (("b", "e"), 5),
        (("c", "e"), 4),
        (("a", "f"), 5),
        (("b", "f"), 5),
        (("c", "f"), 4),
    ];

    true_distances
        .into_iter()
        .map(|((x, y), dist)| PairHistogram::new(x, y, vec![(dist, 0.8), (dist + 1, 0.2)]))
        .collect()
}

fn summarize(topologies: Vec<Topology>) -> Vec<(String, i64)> {
    let mut summary: Vec<(String, i64)> = topologies
        .into_iter()
        .map(|t| (t.newick, (t.score * 1e6).round() as i64))
        .collect();
    summary.sort();
    summary
}

#[test]
fn save_then_restart_matches_uninterrupted_run() -> topolenum::Result<()> {
    let dir = tempfile::tempdir()?;
    let save_name = dir.path().join("checkpoint").to_string_lossy().into_owned();
    let histograms = six_leaves();

    let uninterrupted = Config::new()
        .num_workers(2)
        .num_requested_topologies(100)
        .constraint_freq_cutoff(1.0)
        .terminator_file(dir.path().join("unused_terminator"))
        .enumerate(&histograms)?
        .topologies
        .expect("run to completion");
    assert!(!uninterrupted.is_empty());
    let expected = summarize(uninterrupted);

    // Interrupt immediately; the run should save instead of answering
    let interrupted = Config::new()
        .num_workers(2)
        .num_requested_topologies(100)
        .constraint_freq_cutoff(1.0)
        .save_file_name(save_name.as_str())
        .terminate_after(Duration::ZERO)
        .terminator_file(dir.path().join("unused_terminator"))
        .enumerate(&histograms)?;

    let Some(early) = interrupted.topologies else {
        let archive = dir.path().join("checkpoint.tar.gz");
        assert!(archive.exists(), "interrupted run should write the archive");

        let restarted = Config::new()
            .num_workers(2)
            .num_requested_topologies(100)
            .constraint_freq_cutoff(1.0)
            .restart_from(&archive)
            .terminator_file(dir.path().join("unused_terminator"))
            .enumerate(&histograms)?
            .topologies
            .expect("restart to completion");

        assert_eq!(expected, summarize(restarted));
        return Ok(());
    };

    // The whole search finished before the stop trigger was observed; the
    // result must still match the uninterrupted run
    assert_eq!(expected, summarize(early));
    Ok(())
}

#[test]
fn terminator_file_triggers_save() -> topolenum::Result<()> {
    let dir = tempfile::tempdir()?;
    let save_name = dir.path().join("stopfile_save").to_string_lossy().into_owned();
    let terminator = dir.path().join("stop_enumeration");

    // Present before the run starts, so the very first trigger check fires
    std::fs::write(&terminator, b"")?;

    let outcome = Config::new()
        .num_workers(1)
        .num_requested_topologies(100)
        .constraint_freq_cutoff(1.0)
        .save_file_name(save_name.as_str())
        .terminator_file(&terminator)
        .enumerate(&six_leaves())?;

    assert!(outcome.topologies.is_none());
    assert!(dir.path().join("stopfile_save.tar.gz").exists());
    assert!(!terminator.exists(), "the trigger file should be consumed");

    Ok(())
}

#[test]
fn restart_from_missing_archive_fails_fast() {
    let result = Config::new()
        .restart_from("no_such_archive.tar.gz")
        .enumerate(&six_leaves());

    assert!(result.is_err());
}
