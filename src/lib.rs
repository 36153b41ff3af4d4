//! Turns a tracker's event feed into email notifications.
pub mod config;
pub mod db;
pub mod error;
pub mod mail;
pub mod model;
pub mod pipeline;
pub mod render;
pub mod source;
pub mod worker;
