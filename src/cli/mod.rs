mod query;
mod root;
mod serve;

pub use root::Cli;
