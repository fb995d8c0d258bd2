//! Persistent storage: the SQLite connection wrapper and the Vector Index
//! it backs (L5, spec §4.5).

pub mod connection;
pub mod vector_index;

pub use connection::Storage;
pub use vector_index::VectorIndex;
