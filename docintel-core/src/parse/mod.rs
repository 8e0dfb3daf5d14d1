pub mod document;
pub mod native;
pub mod order;
pub(crate) mod page;
