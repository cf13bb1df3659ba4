use rand::Rng;
use serde::Serialize;

use crate::placement::load::{WorkerLoad, WorkerLoadReport};

/// Score given to a worker with no load report.
pub const UNKNOWN_LOAD_SCORE: f64 = 0.5;

/// Memory a document is assumed to occupy once loaded.
const ASSIGNMENT_COST_MB: f64 = 20.0;
/// Extra charge for assignments whose memory use has not shown up yet.
const NEW_ASSIGNMENT_COST_MB: f64 = 30.0;
/// Extra charge for documents still loading on the worker.
const LOADING_DOC_COST_MB: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredWorker {
    #[serde(flatten)]
    pub report: WorkerLoadReport,
    pub score: f64,
}

impl ScoredWorker {
    pub fn from_report(report: WorkerLoadReport) -> Self {
        let score = score_load(report.load.as_ref());
        Self { report, score }
    }

    pub fn worker_id(&self) -> &str {
        &self.report.worker_id
    }
}

/// Fitness of a worker for one more document, in `[0, 1]`.
///
/// Starts from free memory, charges each assignment, new assignment and
/// loading document a fixed amount of memory, and divides by total memory.
pub fn score_load(load: Option<&WorkerLoad>) -> f64 {
    let Some(load) = load else {
        return UNKNOWN_LOAD_SCORE;
    };
    if load.total_memory_mb <= 0.0 {
        return 0.0;
    }

    let penalty_mb = ASSIGNMENT_COST_MB * load.total_assignments_count as f64
        + NEW_ASSIGNMENT_COST_MB * load.new_assignments_count as f64
        + LOADING_DOC_COST_MB * load.loading_docs_count as f64;
    let score = (load.free_memory_mb - penalty_mb) / load.total_memory_mb;

    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// All candidates scored, best first. Equal scores keep their input order.
pub fn rank_workers(reports: &[WorkerLoadReport]) -> Vec<ScoredWorker> {
    let mut scored: Vec<ScoredWorker> = reports
        .iter()
        .cloned()
        .map(ScoredWorker::from_report)
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

/// Pick the worker that should host a new document.
pub fn pick_worker(reports: &[WorkerLoadReport]) -> Option<ScoredWorker> {
    pick_worker_with_rng(reports, &mut rand::thread_rng())
}

/// Like [`pick_worker`] with an explicit random source.
///
/// The highest score wins and the first listed worker wins ties. When every
/// score is zero the choice is uniform over all candidates, so fully loaded
/// workers share new documents instead of the first one taking them all.
pub fn pick_worker_with_rng<R: Rng + ?Sized>(
    reports: &[WorkerLoadReport],
    rng: &mut R,
) -> Option<ScoredWorker> {
    let scored: Vec<ScoredWorker> = reports
        .iter()
        .cloned()
        .map(ScoredWorker::from_report)
        .collect();

    let mut best: Option<usize> = None;
    for (idx, worker) in scored.iter().enumerate() {
        if best.map_or(true, |b| worker.score > scored[b].score) {
            best = Some(idx);
        }
    }

    let mut idx = best?;
    if scored[idx].score == 0.0 {
        idx = rng.gen_range(0..scored.len());
        tracing::debug!(candidates = scored.len(), idx, "All workers fully loaded, picking at random");
    }
    scored.into_iter().nth(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(free: f64, total: f64, assignments: u64, new: u64, loading: u64) -> WorkerLoad {
        WorkerLoad {
            free_memory_mb: free,
            total_memory_mb: total,
            total_assignments_count: assignments,
            new_assignments_count: new,
            loading_docs_count: loading,
        }
    }

    #[test]
    fn idle_worker_scores_one() {
        assert_eq!(score_load(Some(&WorkerLoad::idle(4096.0))), 1.0);
    }

    #[test]
    fn unknown_load_scores_midpoint() {
        assert_eq!(score_load(None), 0.5);
    }

    #[test]
    fn reference_fixtures() {
        assert_eq!(score_load(Some(&load(3247.0, 4096.0, 2, 0, 1))), 0.780517578125);
        assert_eq!(score_load(Some(&load(2048.0, 4096.0, 5, 1, 2))), 0.46337890625);
        assert_eq!(score_load(Some(&load(0.0, 4096.0, 3, 0, 0))), 0.0);
    }

    #[test]
    fn zero_total_memory_scores_zero() {
        assert_eq!(score_load(Some(&load(0.0, 0.0, 0, 0, 0))), 0.0);
    }

    #[test]
    fn score_never_exceeds_one() {
        assert_eq!(score_load(Some(&load(8192.0, 4096.0, 0, 0, 0))), 1.0);
    }

    #[test]
    fn penalties_are_monotone() {
        let base = score_load(Some(&load(2048.0, 4096.0, 1, 0, 0)));
        assert!(score_load(Some(&load(2048.0, 4096.0, 2, 0, 0))) < base);
        assert!(score_load(Some(&load(2048.0, 4096.0, 1, 1, 0))) < base);
        assert!(score_load(Some(&load(2048.0, 4096.0, 1, 0, 1))) < base);
    }

    #[test]
    fn rank_keeps_input_order_for_ties() {
        let reports = vec![
            WorkerLoadReport::new("a", None),
            WorkerLoadReport::new("b", Some(WorkerLoad::idle(1024.0))),
            WorkerLoadReport::new("c", None),
        ];
        let ranked: Vec<String> = rank_workers(&reports)
            .into_iter()
            .map(|w| w.report.worker_id)
            .collect();
        assert_eq!(ranked, vec!["b", "a", "c"]);
    }
}
