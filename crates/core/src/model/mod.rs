pub mod flow;
pub mod raw;
pub mod span;
