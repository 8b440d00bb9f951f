//! Small shared utilities: bit packing and object pooling

pub mod bits;
pub mod object_pool;

pub use object_pool::ObjectPool;
