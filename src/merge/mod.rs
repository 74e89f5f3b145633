pub mod executor;

pub use executor::{plan_merge, plan_unmerge, MergeExecutor, MergeOutcome, UnmergeOutcome};
