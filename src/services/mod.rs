pub mod image;
pub mod prompt;
pub mod seed;
pub mod workflow;
