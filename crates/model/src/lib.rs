pub mod block;
pub mod config;
pub mod model;

pub use block::ProjectionBlock;
pub use config::GaitNetConfig;
pub use model::{GaitEmbeddings, GaitModel, GaitNet, SUBMODULES};
