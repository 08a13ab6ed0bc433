//! # timecapsule-core
//!
//! Core logic for Time Capsule: messages that are encrypted at rest and
//! emailed at a chosen moment.
//!
//! This crate provides:
//! - **Crypto codec** - authenticated encryption of capsule records
//! - **Capsule store** - one encrypted object per capsule
//! - **Durable scheduler** - `SQLite`-backed one-shot timers with a bounded
//!   dispatch pool, misfire grace and graceful shutdown
//! - **Dispatcher** - composes and sends the unlock email
//! - **Intake** - validation and the store-then-schedule ordering
//! - **Operational reads** - pending timers and capsule metadata
//!
//! [`CapsuleContext`] ties these together for one process.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod capsule;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatch;
mod error;
pub mod intake;
pub mod ops;
pub mod scheduler;
pub mod uploads;

pub use capsule::{Capsule, CapsuleStatus, CapsuleStore, CapsuleSummary, JobId};
pub use codec::{Codec, CodecError};
pub use config::{Config, SchedulerConfig, SmtpConfig, SmtpSecurity};
pub use context::CapsuleContext;
pub use dispatch::{DeliveryError, DispatchArgs, Dispatcher, OutboundMessage, SmtpTransport, Transport};
pub use error::{Error, Result, ValidationError};
pub use intake::{CapsuleRequest, Intake, IntakePolicy, IntakeResponse, UnlockAt};
pub use ops::CapsuleListing;
pub use scheduler::{
    Job, JobHandler, JobOutcome, JobStore, MissReason, PendingJob, Scheduler, SchedulerGuard,
    SchedulerOptions,
};
