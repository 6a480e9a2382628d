//! Reward-function candidates and their append-only store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::JobStateError;
use crate::sandbox::RewardFunction;

/// Measured performance of a trained candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performances {
    pub success_rate: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Set when training or evaluation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Performances {
    pub fn new(success_rate: f64, metrics: BTreeMap<String, f64>) -> Self {
        Self {
            success_rate,
            metrics,
            failure: None,
        }
    }

    /// Record for a job that produced no usable policy.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success_rate: 0.0,
            metrics: BTreeMap::new(),
            failure: Some(reason.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    /// Human-readable summary used in refinement prompts.
    pub fn describe(&self) -> String {
        let mut out = format!("success_rate: {:.3}", self.success_rate);
        for (name, value) in &self.metrics {
            out.push_str(&format!(", {}: {:.4}", name, value));
        }
        if let Some(reason) = &self.failure {
            out.push_str(&format!(", training failed: {}", reason));
        }
        out
    }
}

/// One reward-function hypothesis and what is known about it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub idx: usize,
    reward_func: Option<Arc<RewardFunction>>,
    pub lineage: Vec<usize>,
    policy: Option<PathBuf>,
    performances: Option<Performances>,
}

impl Candidate {
    /// The no-reward reference candidate, always index 0.
    pub fn baseline() -> Self {
        Self {
            idx: 0,
            reward_func: None,
            lineage: Vec::new(),
            policy: None,
            performances: None,
        }
    }

    /// A candidate carrying a compiled reward function.
    pub fn with_reward(
        idx: usize,
        reward_func: Arc<RewardFunction>,
        lineage: Vec<usize>,
    ) -> Result<Self, JobStateError> {
        if idx == 0 {
            return Err(JobStateError::BaselineCarriesReward);
        }
        Ok(Self {
            idx,
            reward_func: Some(reward_func),
            lineage,
            policy: None,
            performances: None,
        })
    }

    pub fn is_baseline(&self) -> bool {
        self.idx == 0
    }

    pub fn reward_func(&self) -> Option<&Arc<RewardFunction>> {
        self.reward_func.as_ref()
    }

    /// Canonical source of the reward function.
    pub fn reward_func_str(&self) -> Option<&str> {
        self.reward_func.as_deref().map(RewardFunction::source)
    }

    pub fn policy(&self) -> Option<&Path> {
        self.policy.as_deref()
    }

    pub fn performances(&self) -> Option<&Performances> {
        self.performances.as_ref()
    }

    pub fn success_rate(&self) -> Option<f64> {
        self.performances.as_ref().map(|p| p.success_rate)
    }

    /// Lineage of a child refined from this candidate.
    pub fn child_lineage(&self) -> Vec<usize> {
        let mut lineage = self.lineage.clone();
        lineage.push(self.idx);
        lineage
    }

    /// Checks that the candidate may be handed to a training job.
    pub fn ensure_trainable(&self) -> Result<(), JobStateError> {
        match (self.idx, &self.reward_func) {
            (0, Some(_)) => Err(JobStateError::BaselineCarriesReward),
            (idx, None) if idx != 0 => Err(JobStateError::MissingRewardFunction(idx)),
            _ => Ok(()),
        }
    }

    pub(crate) fn record_results(
        &mut self,
        policy: Option<PathBuf>,
        performances: Performances,
    ) -> Result<(), JobStateError> {
        if self.performances.is_some() {
            return Err(JobStateError::ResultsAlreadyRecorded(self.idx));
        }
        self.policy = policy;
        self.performances = Some(performances);
        Ok(())
    }
}

/// Append-only candidate history indexed by `idx`.
#[derive(Debug, Clone, Default)]
pub struct CandidateStore {
    candidates: Vec<Candidate>,
}

impl CandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Index the next pushed candidate must carry.
    pub fn next_idx(&self) -> usize {
        self.candidates.len()
    }

    pub fn push(&mut self, candidate: Candidate) -> Result<usize, JobStateError> {
        let expected = self.next_idx();
        if candidate.idx != expected {
            return Err(JobStateError::NonSequentialIndex {
                expected,
                got: candidate.idx,
            });
        }
        candidate.ensure_trainable()?;
        self.candidates.push(candidate);
        Ok(expected)
    }

    pub fn get(&self, idx: usize) -> Option<&Candidate> {
        self.candidates.get(idx)
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> Option<&mut Candidate> {
        self.candidates.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    pub fn as_slice(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn to_vec(&self) -> Vec<Candidate> {
        self.candidates.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::NumericSurface;

    fn reward(source: &str) -> Arc<RewardFunction> {
        Arc::new(
            RewardFunction::compile(source, "reward_func", Arc::new(NumericSurface::standard()))
                .unwrap(),
        )
    }

    const SOURCE: &str = "def reward_func(obs, is_success, is_failure):\n    return 1.0\n";

    #[test]
    fn test_baseline_cannot_carry_reward() {
        assert_eq!(
            Candidate::with_reward(0, reward(SOURCE), vec![]).unwrap_err(),
            JobStateError::BaselineCarriesReward
        );
        assert!(Candidate::baseline().ensure_trainable().is_ok());
    }

    #[test]
    fn test_missing_reward_detected() {
        let mut candidate = Candidate::baseline();
        candidate.idx = 3;
        assert_eq!(
            candidate.ensure_trainable().unwrap_err(),
            JobStateError::MissingRewardFunction(3)
        );
    }

    #[test]
    fn test_store_is_sequential() {
        let mut store = CandidateStore::new();
        assert_eq!(store.push(Candidate::baseline()).unwrap(), 0);
        let err = store
            .push(Candidate::with_reward(2, reward(SOURCE), vec![]).unwrap())
            .unwrap_err();
        assert_eq!(err, JobStateError::NonSequentialIndex { expected: 1, got: 2 });
        assert_eq!(
            store
                .push(Candidate::with_reward(1, reward(SOURCE), vec![]).unwrap())
                .unwrap(),
            1
        );
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(1).unwrap().reward_func_str(), Some(SOURCE));
    }

    #[test]
    fn test_results_written_once() {
        let mut candidate = Candidate::with_reward(1, reward(SOURCE), vec![]).unwrap();
        candidate
            .record_results(None, Performances::new(0.5, BTreeMap::new()))
            .unwrap();
        assert_eq!(
            candidate
                .record_results(None, Performances::failed("again"))
                .unwrap_err(),
            JobStateError::ResultsAlreadyRecorded(1)
        );
        assert_eq!(candidate.success_rate(), Some(0.5));
    }

    #[test]
    fn test_child_lineage() {
        let candidate = Candidate::with_reward(4, reward(SOURCE), vec![1, 2]).unwrap();
        assert_eq!(candidate.child_lineage(), vec![1, 2, 4]);
    }

    #[test]
    fn test_describe_performances() {
        let mut metrics = BTreeMap::new();
        metrics.insert("pole_angle_diff".to_string(), 0.05);
        let text = Performances::new(0.25, metrics).describe();
        assert!(text.contains("success_rate: 0.250"));
        assert!(text.contains("pole_angle_diff: 0.0500"));
        assert!(Performances::failed("boom").describe().contains("boom"));
    }
}
