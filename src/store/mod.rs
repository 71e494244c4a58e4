// Collaborator seams
// Opaque interfaces to the message bus, the watched key-value store, and
// the vector store, with in-memory implementations for tests and the
// single-binary deployment
//
// Numan Thabit 2025 Nov

pub mod bus;
pub mod kv;
pub mod vectors;

pub use bus::{EventBus, MemoryBus};
pub use kv::{ConfigStore, KvEvent, KvEventKind, MemoryConfigStore};
pub use vectors::{MemoryVectorStore, VectorStore};
