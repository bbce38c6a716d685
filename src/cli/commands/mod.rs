pub mod migration;
pub mod token;
