// Small self-contained data structures shared across subsystems.

pub mod id_alloc;
pub mod radix_tree;
pub mod random;
