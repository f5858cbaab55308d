pub mod base_model;
pub mod hst;
pub mod hst_tree;
pub mod iforest;
