//! Client engine for the Penny Game, exposing modules for the observer binary and integration tests.

pub mod config;
pub mod dto;
pub mod error;
pub mod services;
pub mod state;
