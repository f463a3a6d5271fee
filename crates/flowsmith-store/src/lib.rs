//! # flowsmith-store
//!
//! SQLite persistence for Flowsmith.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  FlowStore   AutomationStore   LearningStore  │
//! ├───────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking)      │
//! │  Migrations (versioned, transactional)        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ```ignore
//! let db = Database::open_and_migrate("data/flowsmith.db").await?;
//! let automations = AutomationStore::new(db.clone());
//! ```

pub mod automation_store;
pub mod db;
pub mod error;
pub mod flow_store;
pub mod learning_store;
pub mod migration;

// ── re-exports ───────────────────────────────────────────────────────

pub use automation_store::{AutomationStore, StoredAutomation};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use flow_store::{FlowStore, NewSavedFlow, SavedFlow};
pub use learning_store::{LearningRecord, LearningStats, LearningStore, NewLearningRecord};
