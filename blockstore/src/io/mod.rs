mod block;
mod image;

pub use block::{BlockNumber, BlockStorage};
pub use image::ImageLoader;
