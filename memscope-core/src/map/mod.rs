/*!
The typed memory map: discovered-object graph, range index, plausibility
scoring and the parallel builder that drives them.
*/

pub mod node;
#[doc(hidden)]
pub use node::{MemoryMapNode, NodeId, TypeAlternative};

pub mod store;
#[doc(hidden)]
pub use store::{CandidateNode, MergeOutcome, NodeStore};

pub mod range_tree;
#[doc(hidden)]
pub use range_tree::{RangeProps, RangeTree};

pub mod probability;

pub mod builder;
#[doc(hidden)]
pub use builder::{build, BuildConfig, BuildHandle, BuildStats, RootSpec};
