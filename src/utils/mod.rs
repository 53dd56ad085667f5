pub mod background;
pub mod pattern;

pub use background::BackgroundLoop;
