use crate::error::CacheError;

/// Outcome of one try of a retryable step.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// Worth another try after re-synchronizing with the cluster.
    Retry(CacheError),
    Fatal(CacheError),
}

impl<T> Attempt<T> {
    pub fn from_error(error: CacheError) -> Self {
        if error.is_retryable() {
            Attempt::Retry(error)
        } else {
            Attempt::Fatal(error)
        }
    }
}

/// Per-operation retry allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u32,
}

impl RetryBudget {
    pub fn new(retries: u32) -> Self {
        Self { remaining: retries }
    }

    /// Takes one retry; `false` once the budget is exhausted.
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}
