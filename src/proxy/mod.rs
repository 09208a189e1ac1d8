pub mod adapter;
pub mod engine;
pub mod envelope;
pub mod handler;
pub mod headers;
pub mod registry;
pub mod signature;
pub mod token;
pub mod upstream;
