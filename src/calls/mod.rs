pub mod lifecycle;
pub mod relay;
