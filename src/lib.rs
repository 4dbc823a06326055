pub mod about;
pub mod config;
pub mod error;
pub mod genome_index;
pub mod model;
pub mod off_target;
pub mod oligo;
pub mod pipeline;
pub mod primer_design;
pub mod rna_structure;
pub mod scanner;
pub mod scoring;
pub mod sequence_utils;
pub mod store;
