//! `chorus-ai`
//!
//! **Responsibility:** the language-model generation boundary.
//!
//! The provider is a black box: given a structured [`Prompt`] it returns text
//! or fails with a [`GenerationError`] that classifies itself as transient or
//! permanent. This crate does not know about jobs, posts or personas.

pub mod generator;
pub mod http;
pub mod prompt;
pub mod scripted;

pub use generator::{generate_bounded, Generated, GenerationError, Generator};
pub use http::{HttpGenerator, HttpGeneratorConfig};
pub use prompt::{Message, Prompt, ResponseFormat, Role};
pub use scripted::ScriptedGenerator;
