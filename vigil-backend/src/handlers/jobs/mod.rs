pub mod dto;
pub mod enqueue;
pub mod get;
pub mod list;

pub use enqueue::enqueue;
pub use get::get;
pub use list::list;
