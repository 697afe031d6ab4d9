//! Fairshare tree (§6.2, §9 `fairshare_perc`/`fairshare_factor`).
//!
//! A usage tree loaded once per cycle from a site file of
//! `name parent shares` lines, against which each entity's historical
//! usage is decayed and compared to derive the `fairshare_perc` and
//! `fairshare_factor` inputs the job-sort formula reads (§9).

pub mod tree;

pub use tree::{FairshareNode, FairshareTree};
