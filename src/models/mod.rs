pub mod audit;
pub mod cache;
pub mod forward;
pub mod identity;
pub mod target;
