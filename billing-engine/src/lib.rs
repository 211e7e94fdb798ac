//! Billing engine for an AI API gateway: pre-authorization, charging,
//! async completion, compensation and reconciliation.

pub mod config;
pub mod error;
pub mod models;
pub mod policy;
pub mod services;
pub mod startup;
pub mod stores;
