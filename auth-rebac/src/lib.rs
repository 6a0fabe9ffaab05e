//! Relationship-based authorization for a multi-tenant virtual filesystem
//!
//! Permissions are stored as relationship tuples ("alice is `owner` of
//! `/acme/projects`") and evaluated per check by expanding:
//! - direct tuples on the resource
//! - transitive group membership (`member_of`)
//! - inheritance down the directory hierarchy and from the zone object
//!
//! Zones are hard tenant boundaries. The only relation that crosses one is
//! `shared_with`, and it grants viewer-level access to exactly the resource
//! it names.
//!
//! # Core Concepts
//!
//! - **Zone**: tenant; every node, subject and tuple belongs to one
//! - **Subject**: user, agent or group
//! - **Object**: file, directory, zone or group
//! - **Tuple**: "subject has relation to object", with a lifecycle state
//! - **Check**: `(subject, action, resource)` to Allow or Deny, failing closed
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{
//!     AuthorizationEngine, InMemoryResourceTree, InMemoryTupleRepository, Action, SubjectRef,
//!     Relation, ZoneId,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let acme = ZoneId::new("acme");
//!     let tree = InMemoryResourceTree::new();
//!     tree.add_zone_root(&acme, "/acme");
//!     tree.add_file("/acme", "/acme/plan.md")?;
//!     tree.add_subject(SubjectRef::user("alice"), &acme);
//!     tree.add_subject(SubjectRef::user("bob"), &acme);
//!
//!     let engine = AuthorizationEngine::new(Arc::new(InMemoryTupleRepository::new()), Arc::new(tree));
//!     let alice = SubjectRef::user("alice");
//!     let bob = SubjectRef::user("bob");
//!
//!     // alice creates the file and owns it
//!     engine.resource_created("/acme/plan.md", &alice).await?;
//!     engine.grant(&alice, &bob, Relation::Viewer, "/acme/plan.md", &acme).await?;
//!
//!     let response = engine.check(&bob, Action::Read, "/acme/plan.md", &acme).await;
//!     assert!(response.is_allowed());
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod expand;
pub mod lifecycle;
pub mod models;
pub mod repository;
pub mod schema;
pub mod sharing;
pub mod stats;
pub mod store;
pub mod tree;
pub mod zone;

pub use cache::{CheckCache, VersionScope, VersionStamp, VersionTable};
pub use config::EngineConfig;
pub use engine::*;
pub use error::*;
pub use expand::{EffectiveGrant, Expansion, RelationExpander};
pub use models::*;
pub use repository::{InMemoryTupleRepository, PostgresTupleRepository, TupleRepository};
pub use schema::*;
pub use stats::CheckStats;
pub use tree::{DeletionHook, InMemoryResourceTree, NoopDeletion, ResourceTree};
