pub mod atomic;
pub mod schema;
