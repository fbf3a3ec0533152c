// src/lib.rs

//! Pagewatch: change monitoring for payroll and regulatory web pages

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
