//! Testing utilities and mock implementations
//!
//! This module provides an in-process broker so the supervisor, exchange
//! bootstrap and recovery paths can be tested without RabbitMQ.

pub mod mocks;

pub use mocks::*;
