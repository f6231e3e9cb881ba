pub mod run;

pub use run::{run, RunError, RunOptions};
