// Marginalia - Collaborative Annotation State Engine

pub mod access;
pub mod convergent;
pub mod registry;
pub mod resolve;
pub mod storage;
pub mod sync;
pub mod workspace;

pub use access::{Authorization, InMemoryAcl, Permission};
pub use convergent::{Delta, Document, DocumentError, DocumentSnapshot, Operation};
pub use registry::{DocumentRegistry, RegistryConfig, RegistryError};
pub use resolve::{resolve_tristate, TriState};
pub use storage::{LocalStore, MemoryStore, PersistenceAdapter, StorageConfig, StorageError};
pub use sync::{SessionHandle, SessionManager, SyncError, SyncEvent};
pub use workspace::WorkspaceRecord;
