pub mod loaders;
pub mod repository;

pub use loaders::*;
pub use repository::*;
