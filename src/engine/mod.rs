pub mod table;
pub mod types;
