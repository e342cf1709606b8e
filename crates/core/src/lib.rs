//! `chorus-core`: shared building blocks.
//!
//! This crate contains identifiers and the domain error model used by every
//! other crate (no infrastructure concerns).

pub mod error;
pub mod failure;
pub mod id;

pub use error::DomainError;
pub use failure::FailureKind;
pub use id::{BattleId, PersonaId, PostId, UserId};
