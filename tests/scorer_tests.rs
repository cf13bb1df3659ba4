use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use doc_host::placement::{
    load_reports_file, pick_worker, pick_worker_with_rng, score_load, WorkerLoad, WorkerLoadReport,
};

fn load(free: f64, total: f64, assignments: u64, new: u64, loading: u64) -> Option<WorkerLoad> {
    Some(WorkerLoad {
        free_memory_mb: free,
        total_memory_mb: total,
        total_assignments_count: assignments,
        new_assignments_count: new,
        loading_docs_count: loading,
    })
}

#[test]
fn test_empty_list_picks_nothing() {
    assert!(pick_worker(&[]).is_none());
}

#[test]
fn test_single_unknown_worker_scores_midpoint() {
    let picked = pick_worker(&[WorkerLoadReport::new("w1", None)]).unwrap();
    assert_eq!(picked.worker_id(), "w1");
    assert_eq!(picked.score, 0.5);
    assert!(picked.report.load.is_none());
}

#[test]
fn test_scoring_fixtures() {
    assert_eq!(score_load(load(4096.0, 4096.0, 0, 0, 0).as_ref()), 1.0);
    assert_eq!(
        score_load(load(3247.0, 4096.0, 2, 0, 1).as_ref()),
        0.780517578125
    );
    assert_eq!(score_load(None), 0.5);
    assert_eq!(
        score_load(load(2048.0, 4096.0, 5, 1, 2).as_ref()),
        0.46337890625
    );
    assert_eq!(score_load(load(0.0, 4096.0, 4, 0, 0).as_ref()), 0.0);
}

#[test]
fn test_highest_score_wins() {
    let reports = vec![
        WorkerLoadReport::new("busy", load(2048.0, 4096.0, 5, 1, 2)),
        WorkerLoadReport::new("unknown", None),
        WorkerLoadReport::new("free", load(3247.0, 4096.0, 2, 0, 1)),
    ];
    let picked = pick_worker(&reports).unwrap();
    assert_eq!(picked.worker_id(), "free");
    assert_eq!(picked.score, 0.780517578125);
}

#[test]
fn test_first_listed_wins_ties() {
    let reports = vec![
        WorkerLoadReport::new("a", load(1024.0, 4096.0, 0, 0, 0)),
        WorkerLoadReport::new("b", load(4096.0, 4096.0, 0, 0, 0)),
        WorkerLoadReport::new("c", load(4096.0, 4096.0, 0, 0, 0)),
    ];
    assert_eq!(pick_worker(&reports).unwrap().worker_id(), "b");

    // Moving the loser around does not change which tied worker is first.
    let reports = vec![
        WorkerLoadReport::new("b", load(4096.0, 4096.0, 0, 0, 0)),
        WorkerLoadReport::new("a", load(1024.0, 4096.0, 0, 0, 0)),
        WorkerLoadReport::new("c", load(4096.0, 4096.0, 0, 0, 0)),
    ];
    assert_eq!(pick_worker(&reports).unwrap().worker_id(), "b");

    let reports = vec![
        WorkerLoadReport::new("c", load(4096.0, 4096.0, 0, 0, 0)),
        WorkerLoadReport::new("b", load(4096.0, 4096.0, 0, 0, 0)),
    ];
    assert_eq!(pick_worker(&reports).unwrap().worker_id(), "c");
}

#[test]
fn test_unknown_workers_tie_on_first() {
    let reports = vec![
        WorkerLoadReport::new("x", None),
        WorkerLoadReport::new("y", None),
    ];
    for _ in 0..10 {
        assert_eq!(pick_worker(&reports).unwrap().worker_id(), "x");
    }
}

#[test]
fn test_deterministic_for_identical_inputs() {
    let reports = vec![
        WorkerLoadReport::new("a", load(1000.0, 4096.0, 3, 0, 0)),
        WorkerLoadReport::new("b", load(1500.0, 4096.0, 4, 1, 0)),
        WorkerLoadReport::new("c", None),
    ];
    let first = pick_worker(&reports).unwrap();
    for _ in 0..20 {
        assert_eq!(pick_worker(&reports).unwrap(), first);
    }
}

#[test]
fn test_all_zero_scores_spread_picks() {
    let reports: Vec<WorkerLoadReport> = ["w1", "w2", "w3", "w4"]
        .iter()
        .map(|id| WorkerLoadReport::new(*id, load(0.0, 4096.0, 10, 0, 0)))
        .collect();

    let mut rng = StdRng::seed_from_u64(7);
    let trials = 100;
    let mut picks: HashMap<String, usize> = HashMap::new();
    for _ in 0..trials {
        let picked = pick_worker_with_rng(&reports, &mut rng).unwrap();
        assert_eq!(picked.score, 0.0);
        *picks.entry(picked.report.worker_id).or_default() += 1;
    }

    for report in &reports {
        let count = picks.get(&report.worker_id).copied().unwrap_or(0);
        assert!(count >= 1, "{} was never picked", report.worker_id);
        assert!(count <= trials / 2, "{} picked {} times", report.worker_id, count);
    }
}

#[test]
fn test_nonzero_score_is_not_randomized() {
    let reports = vec![
        WorkerLoadReport::new("full", load(0.0, 4096.0, 10, 0, 0)),
        WorkerLoadReport::new("barely", load(100.0, 4096.0, 1, 0, 0)),
    ];
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..20 {
        assert_eq!(
            pick_worker_with_rng(&reports, &mut rng).unwrap().worker_id(),
            "barely"
        );
    }
}

#[test]
fn test_concurrent_scoring() {
    let reports = vec![
        WorkerLoadReport::new("a", load(1024.0, 4096.0, 1, 0, 0)),
        WorkerLoadReport::new("b", load(3072.0, 4096.0, 1, 0, 0)),
    ];
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..100 {
                    assert_eq!(pick_worker(&reports).unwrap().worker_id(), "b");
                }
            });
        }
    });
}

#[test]
fn test_reports_from_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("reports.json");
    std::fs::write(
        &path,
        r#"[
            {"workerId": "w1", "load": {"freeMemoryMB": 2048, "totalMemoryMB": 4096,
              "totalAssignmentsCount": 5, "newAssignmentsCount": 1, "loadingDocsCount": 2}},
            {"workerId": "w2", "load": null}
        ]"#,
    )
    .unwrap();

    let reports = load_reports_file(&path).unwrap();
    let picked = pick_worker(&reports).unwrap();
    assert_eq!(picked.worker_id(), "w2");
    assert_eq!(picked.score, 0.5);
}
