//! # Token usage accounting
//!
//! A round makes two model calls (tool selection, then decision). [`Usage`]
//! folds their token counts into per-round and per-run totals so a host can
//! watch what each case costs.
//!
//! ```rust
//! use tower_triage::usage::Usage;
//!
//! let round = Usage::call(120, 30) + Usage::call(400, 80);
//! assert_eq!(round.total_tokens(), 630);
//! assert_eq!(round.model_calls, 2);
//! ```

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token counts over some number of model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub model_calls: usize,
}

impl Usage {
    /// One model call.
    pub fn call(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            model_calls: 1,
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.model_calls += rhs.model_calls;
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Self {
        iter.fold(Usage::default(), Add::add)
    }
}
