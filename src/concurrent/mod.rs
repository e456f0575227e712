mod node;
mod tree;
mod version;

pub use tree::ConcurrentAvlMap;
