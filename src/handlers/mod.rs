pub mod elevated;
pub mod public;
