pub mod args;
pub mod identity;
