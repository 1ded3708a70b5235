pub mod errors;
pub mod experiment;
pub mod job;
pub mod params;

pub use errors::*;
pub use experiment::*;
pub use job::*;
pub use params::*;
