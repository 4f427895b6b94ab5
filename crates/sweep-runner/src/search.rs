use std::collections::VecDeque;

use crate::config::ConfigPayload;
use crate::scheduler::EvaluationOutcome;

/// Source of configurations for an ask/tell search loop.
///
/// `ask` hands out up to `batch_size` new payloads; an empty answer ends
/// the search. `tell` receives the resolved evaluations of the last batch,
/// after they have all been aggregated.
pub trait ProposalGenerator {
    fn ask(&mut self, batch_size: usize) -> Vec<ConfigPayload>;
    fn tell(&mut self, results: &[EvaluationOutcome]);
}

/// Hands out a fixed list in order and records what it is told.
#[derive(Debug, Default)]
pub struct FixedProposals {
    pending: VecDeque<ConfigPayload>,
    history: Vec<EvaluationOutcome>,
}

impl FixedProposals {
    pub fn new(payloads: impl IntoIterator<Item = ConfigPayload>) -> Self {
        Self {
            pending: payloads.into_iter().collect(),
            history: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn history(&self) -> &[EvaluationOutcome] {
        &self.history
    }
}

impl ProposalGenerator for FixedProposals {
    fn ask(&mut self, batch_size: usize) -> Vec<ConfigPayload> {
        let n = batch_size.min(self.pending.len());
        self.pending.drain(..n).collect()
    }

    fn tell(&mut self, results: &[EvaluationOutcome]) {
        self.history.extend_from_slice(results);
    }
}
