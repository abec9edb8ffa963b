mod chaos;
mod opts;

pub use chaos::*;
pub use opts::Opts;
