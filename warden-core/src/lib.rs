pub mod events;
pub mod tree;
