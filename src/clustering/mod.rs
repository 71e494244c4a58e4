// Clustering - control-plane grouping of error events
// Online assignment with incremental centroid updates plus a periodic
// k-means re-fit over the stored vectors
//
// Numan Thabit 2025 Nov

pub mod engine;
pub mod kmeans;

pub use engine::ClusteringEngine;
