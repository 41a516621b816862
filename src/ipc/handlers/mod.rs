pub mod attempts;
pub mod catalog;
pub mod core;
pub mod review;
pub mod roster;
pub mod summary;
