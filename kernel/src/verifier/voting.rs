//! Vote selection among speculate candidates.
//!
//! Candidates are scored on a 100-point scale; only fully-verified
//! proofs are eligible. Selection is deterministic: identical candidate
//! lists always produce the same winner.

use tracing::{info, warn};

use crate::proof::Proof;
use crate::state::Risk;

/// Weighted score for one candidate, out of 100.
///
/// | dimension     | weight |
/// |---------------|--------|
/// | verification  | 40     |
/// | confidence    | 20     |
/// | diff size     | 15     |
/// | risk          | 15     |
/// | duration      | 10     |
pub fn score_candidate(candidate: &Proof, all_candidates: &[Proof]) -> f64 {
    let mut score = 0.0;

    // Verification: eligibility already filtered failures, so the full
    // 40 points apply.
    score += 40.0;

    // Confidence: 0-20.
    score += candidate.confidence * 20.0;

    // Diff size: 0-15, smaller is better relative to the field.
    let this_lines = candidate.patch.diff_stats.total_lines();
    let max_lines = all_candidates
        .iter()
        .map(|c| c.patch.diff_stats.total_lines())
        .max()
        .unwrap_or(0)
        .max(1);
    score += (1.0 - this_lines as f64 / max_lines as f64) * 15.0;

    // Risk: 0-15.
    score += match candidate.risk_classification {
        Risk::Low => 15.0,
        Risk::Medium => 10.0,
        Risk::High => 5.0,
        Risk::Critical => 0.0,
    };

    // Duration: 0-10, faster is better. All-zero durations (e.g. cached
    // replays) award the full 10 to everyone.
    let this_duration = candidate.metadata.duration_ms;
    let max_duration = all_candidates
        .iter()
        .map(|c| c.metadata.duration_ms)
        .max()
        .unwrap_or(0);
    if max_duration > 0 {
        score += (1.0 - this_duration as f64 / max_duration as f64) * 10.0;
    } else {
        score += 10.0;
    }

    score
}

/// Pick the winning candidate, or `None` when nothing verified or the
/// best score sits below `vote_threshold × 100`.
///
/// Ties break on higher confidence, then lexicographically lower
/// workcell id.
pub fn vote<'a>(candidates: &'a [Proof], vote_threshold: f64) -> Option<&'a Proof> {
    let eligible: Vec<&Proof> = candidates
        .iter()
        .filter(|c| c.verification.all_passed)
        .collect();

    if eligible.is_empty() {
        warn!(candidates = candidates.len(), "No verified candidates in vote");
        return None;
    }

    let mut best: Option<(&Proof, f64)> = None;
    for candidate in eligible {
        let score = score_candidate(candidate, candidates);
        let wins = match best {
            None => true,
            Some((current, current_score)) => {
                score > current_score
                    || (score == current_score
                        && (candidate.confidence > current.confidence
                            || (candidate.confidence == current.confidence
                                && candidate.workcell_id < current.workcell_id)))
            }
        };
        if wins {
            best = Some((candidate, score));
        }
    }

    let (winner, best_score) = best?;

    info!(
        winner = %winner.workcell_id,
        score = best_score,
        candidates = candidates.len(),
        "Vote winner selected"
    );

    let threshold = vote_threshold * 100.0;
    if best_score >= threshold {
        Some(winner)
    } else {
        warn!(score = best_score, threshold, "Winner below vote threshold");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::ProofStatus;

    fn candidate(
        workcell_id: &str,
        all_passed: bool,
        confidence: f64,
        diff_lines: u64,
        risk: Risk,
        duration_ms: u64,
    ) -> Proof {
        let mut proof = Proof::new(workcell_id, "1", ProofStatus::Success);
        proof.verification.all_passed = all_passed;
        proof.set_confidence(confidence);
        proof.patch.diff_stats.insertions = diff_lines;
        proof.risk_classification = risk;
        proof.metadata.duration_ms = duration_ms;
        proof
    }

    #[test]
    fn test_speculate_vote_scoring() {
        // A: all_passed, conf 0.9, 50 lines, low risk, 10s.
        // B: all_passed, conf 0.7, 200 lines, medium risk, 30s.
        let candidates = vec![
            candidate("wc-1-a", true, 0.9, 50, Risk::Low, 10_000),
            candidate("wc-1-b", true, 0.7, 200, Risk::Medium, 30_000),
        ];

        let score_a = score_candidate(&candidates[0], &candidates);
        let score_b = score_candidate(&candidates[1], &candidates);

        // A = 40 + 18 + 15*(1-50/200) + 15 + 10*(1-10/30) ≈ 90.92
        assert!((score_a - 90.9166).abs() < 0.01, "A scored {score_a}");
        // B = 40 + 14 + 0 + 10 + 0 = 64
        assert!((score_b - 64.0).abs() < 0.01, "B scored {score_b}");

        let winner = vote(&candidates, 0.7).expect("winner");
        assert_eq!(winner.workcell_id, "wc-1-a");
    }

    #[test]
    fn test_threshold_blocks_winner() {
        let candidates = vec![
            candidate("wc-1-a", true, 0.9, 50, Risk::Low, 10_000),
            candidate("wc-1-b", true, 0.7, 200, Risk::Medium, 30_000),
        ];
        // Best score ≈ 90.9 < 95 ⇒ no winner; the runner's fallback
        // picks the highest-confidence passing candidate instead.
        assert!(vote(&candidates, 0.95).is_none());
    }

    #[test]
    fn test_failed_gates_ineligible() {
        let candidates = vec![
            candidate("wc-1-a", false, 0.99, 10, Risk::Low, 1_000),
            candidate("wc-1-b", true, 0.5, 100, Risk::Medium, 5_000),
        ];
        let winner = vote(&candidates, 0.5).expect("winner");
        assert_eq!(winner.workcell_id, "wc-1-b");
    }

    #[test]
    fn test_single_passing_candidate_wins() {
        let candidates = vec![candidate("wc-1-a", true, 0.6, 40, Risk::Low, 2_000)];
        let winner = vote(&candidates, 0.5).expect("winner");
        assert_eq!(winner.workcell_id, "wc-1-a");
    }

    #[test]
    fn test_single_failing_candidate_no_winner() {
        let candidates = vec![candidate("wc-1-a", false, 0.6, 40, Risk::Low, 2_000)];
        assert!(vote(&candidates, 0.5).is_none());
    }

    #[test]
    fn test_all_zero_durations_score_full_speed_points() {
        let candidates = vec![
            candidate("wc-1-a", true, 1.0, 0, Risk::Low, 0),
            candidate("wc-1-b", true, 1.0, 0, Risk::Low, 0),
        ];
        let score = score_candidate(&candidates[0], &candidates);
        // 40 + 20 + 15 + 15 + 10 = 100
        assert!((score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tie_breaks_on_confidence_then_workcell_id() {
        let tied = vec![
            candidate("wc-1-b", true, 0.8, 10, Risk::Low, 100),
            candidate("wc-1-a", true, 0.8, 10, Risk::Low, 100),
        ];
        // Identical scores and confidence ⇒ lower workcell id wins.
        let winner = vote(&tied, 0.5).expect("winner");
        assert_eq!(winner.workcell_id, "wc-1-a");

        let by_confidence = vec![
            candidate("wc-1-a", true, 0.6, 10, Risk::Low, 100),
            candidate("wc-1-b", true, 0.8, 10, Risk::Low, 100),
        ];
        // Confidence feeds the score, so the higher-confidence proof
        // simply outscores the other.
        let winner = vote(&by_confidence, 0.5).expect("winner");
        assert_eq!(winner.workcell_id, "wc-1-b");
    }

    #[test]
    fn test_vote_deterministic() {
        let candidates = vec![
            candidate("wc-1-a", true, 0.7, 120, Risk::Medium, 9_000),
            candidate("wc-1-b", true, 0.7, 80, Risk::Low, 14_000),
            candidate("wc-1-c", true, 0.9, 200, Risk::High, 4_000),
        ];
        let first = vote(&candidates, 0.5).map(|p| p.workcell_id.clone());
        for _ in 0..10 {
            assert_eq!(
                vote(&candidates, 0.5).map(|p| p.workcell_id.clone()),
                first
            );
        }
    }

    #[test]
    fn test_empty_candidates_no_winner() {
        assert!(vote(&[], 0.5).is_none());
    }
}
