pub mod document;
pub mod error;
pub mod parser;
pub mod utils;
