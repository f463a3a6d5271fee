//! Flow generation and automation engine for Flowsmith.
//!
//! This crate provides:
//!
//! - **Intent interpretation**: keyword classification with an optional
//!   language-model pass via [`interpreter::IntentInterpreter`].
//! - **Flow construction**: deterministic graph building and repair via
//!   [`builder::build_flow`], scored by [`validator::validate`].
//! - **Execution**: single runs in real or dry-run mode via
//!   [`executor::FlowExecutor`].
//! - **Automations**: persisted recurring flows via
//!   [`registry::AutomationRegistry`], driven by [`scheduler::Scheduler`].
//!
//! [`service::FlowService`] ties all of it together for front-ends.

pub mod builder;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod flow;
pub mod intent;
pub mod interpreter;
pub mod learning;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod validator;

pub use builder::build_flow;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, ExecutorConfig, InterpreterConfig, SchedulerConfig};
pub use error::{EngineError, Result};
pub use executor::{ExecutionReport, FlowExecutor, NodeReport, NodeStatus, RunMode, RunOutcome};
pub use flow::{Flow, FlowEdge, FlowMetadata, FlowNode, NodeKind};
pub use intent::{ActionClass, Complexity, IntentDescriptor, IntentSource, OutputKind};
pub use interpreter::{IntentInterpreter, IntentModel, KeywordClassifier, LlmIntentModel};
pub use learning::LearningLog;
pub use registry::{Automation, AutomationRegistry};
pub use scheduler::Scheduler;
pub use service::{EngineStats, FlowService, Generation};
pub use validator::{ValidationPolicy, ValidationResult, Verdict, validate};
