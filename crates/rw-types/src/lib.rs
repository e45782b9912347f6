pub mod features;
pub mod factories;
pub mod experiment;
pub mod judgments;
pub mod errors;

pub use features::*;
pub use factories::*;
pub use experiment::*;
pub use judgments::*;
pub use errors::*;
