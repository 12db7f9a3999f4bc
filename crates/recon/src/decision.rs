use crate::config::PolicyConfig;
use crate::model::{LinkMethod, MatchCandidate, MatchReason, SkipReason};

/// Absorbs float noise when comparing score gaps to the ambiguity margin.
const SCORE_EPSILON: f64 = 1e-9;

/// How the device/plate pair reached the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionMode {
    /// Discovered from the feed.
    Auto,
    /// Asserted by an operator. `pair_complete` is false when either the
    /// tracker id or the plate was left blank.
    Manual { pair_complete: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    AutoApply {
        candidate: MatchCandidate,
        method: LinkMethod,
    },
    Suggest(Vec<MatchCandidate>),
    Skip(SkipReason),
}

/// Classify ranked candidates (best first) into apply / suggest / skip.
pub fn decide(candidates: &[MatchCandidate], mode: DecisionMode, policy: &PolicyConfig) -> Decision {
    if mode == (DecisionMode::Manual { pair_complete: false }) {
        return Decision::Skip(SkipReason::IncompletePair);
    }

    let eligible: Vec<&MatchCandidate> = candidates
        .iter()
        .filter(|c| c.score + SCORE_EPSILON >= policy.suggestion_floor)
        .collect();

    let Some(top) = eligible.first().copied() else {
        return Decision::Skip(SkipReason::NoCandidates);
    };

    if let DecisionMode::Manual { .. } = mode {
        let exact = eligible
            .iter()
            .filter(|c| c.reason == MatchReason::ExactMatch)
            .count();
        if top.reason == MatchReason::ExactMatch && exact == 1 {
            return Decision::AutoApply {
                candidate: top.clone(),
                method: LinkMethod::Manual,
            };
        }
    }

    let clears_bar = top.score + SCORE_EPSILON >= policy.auto_apply_threshold;
    if clears_bar && !is_ambiguous(&eligible, policy.ambiguity_margin) {
        return Decision::AutoApply {
            candidate: top.clone(),
            method: LinkMethod::Auto,
        };
    }

    Decision::Suggest(eligible.into_iter().cloned().collect())
}

/// Candidates clearing the suggestion floor, rank order kept.
pub fn above_floor(candidates: &[MatchCandidate], policy: &PolicyConfig) -> Vec<MatchCandidate> {
    candidates
        .iter()
        .filter(|c| c.score + SCORE_EPSILON >= policy.suggestion_floor)
        .cloned()
        .collect()
}

/// True when the runner-up is within `margin` of the top score (inclusive).
fn is_ambiguous(ranked: &[&MatchCandidate], margin: f64) -> bool {
    match ranked {
        [top, second, ..] => top.score - second.score <= margin + SCORE_EPSILON,
        _ => false,
    }
}
