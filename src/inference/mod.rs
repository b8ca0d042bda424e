pub mod sampling;
pub mod suggest;
pub mod transform;

pub use suggest::Suggester;
pub use transform::Transformer;
