pub mod attention;
pub mod block;
pub mod gpt;

pub use gpt::{Gpt2, Gpt2Config};
