pub mod hub;
pub mod weights;

pub use hub::{HubClient, ModelFiles};
pub use weights::{load_gpt2, load_t5};
