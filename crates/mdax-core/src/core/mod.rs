pub mod jacobian;
pub mod models;
pub mod registry;
