pub mod content;
pub mod perceptual;

pub use perceptual::PerceptualHash;
