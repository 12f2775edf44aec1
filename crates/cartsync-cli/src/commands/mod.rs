pub mod add;
pub mod common;
pub mod demo;
pub mod list;
pub mod remove;
