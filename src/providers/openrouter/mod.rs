pub mod adapter;
pub mod models;

pub use adapter::OpenRouterProvider;
