#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
//! Multi-task mortality prediction over ICU time series with a
//! demographic fairness audit of the resulting predictions.

pub mod aggregate;
pub mod config;
pub mod data;
pub mod fairness;
pub mod heads;
pub mod kfold;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod report;
pub mod train;
