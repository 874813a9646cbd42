//! Trellis — a reconciliation engine for hierarchical deployments.
//!
//! A top-level deployment request (an [`types::Installation`]) decomposes
//! into nested sub-units and ultimately into atomic work items
//! ([`types::DeployItem`]) processed by external deployers. The engine
//! computes and propagates work requests through the hierarchy exactly once
//! per change, routes data produced by one unit as input to dependent
//! units, detects deployer staleness, and aggregates success/failure
//! bottom-up — over a store that offers only independent, optimistically
//! versioned objects and a watch primitive.

pub mod controllers;
pub mod dataflow;
pub mod graph;
pub mod jobs;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
pub mod test_utils;
