pub mod artifacts;
pub mod database;
pub mod dispatches;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use artifacts::{ArtifactRepo, ArtifactRow};
pub use database::Database;
pub use dispatches::DispatchRepo;
pub use error::StoreError;
pub use sessions::{Session, SessionRecord, SessionRepo};
