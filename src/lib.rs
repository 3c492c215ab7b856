//! Daily prayer reminders for one device.
//!
//! The [`store::AlarmStore`] owns the alarm collection and keeps it in step
//! with the notification scheduler and with storage. The binary serves it over
//! HTTP and delivers reminders through APNs.

pub mod alarm;
pub mod apns;
pub mod authtoken;
pub mod config;
pub mod device;
pub mod error;
pub mod models;
pub mod persistence;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod timing;
pub mod types;
pub mod util;
