//! Integration clients for Flowsmith.
//!
//! Each client implements the [`Integration`] trait defined in [`traits`]
//! and provides one [`Capability`]. The [`catalog`] lists the recognized
//! integrations and the credentials they need; a [`CapabilityTable`] holds
//! the live clients the executor dispatches to.

pub mod catalog;
pub mod email;
pub mod error;
pub mod quote;
pub mod slack;
pub mod table;
pub mod telegram;
pub mod traits;

pub use catalog::{CATALOG, Credentials, IntegrationSpec, IntegrationStatus};
pub use email::{SmtpMailer, SmtpSettings};
pub use error::{AdapterError, Result};
pub use quote::QuoteFeed;
pub use slack::SlackChannel;
pub use table::CapabilityTable;
pub use telegram::TelegramBot;
pub use traits::{
    ActionOutput, ActionRequest, Capability, DeliveryReceipt, HealthStatus, Integration, Quote,
};
