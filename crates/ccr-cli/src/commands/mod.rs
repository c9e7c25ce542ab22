pub mod check;
pub mod clean;
pub mod fmt;
pub mod generate;
pub mod hash;
pub mod plan;
pub mod query;
