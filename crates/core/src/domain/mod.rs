pub mod message;
pub mod summary;
pub mod suspension;
