pub mod lifecycle;
pub mod store;
pub mod visio;
pub mod window;
