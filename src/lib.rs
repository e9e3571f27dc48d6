pub mod api;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod groups;
pub mod ical;
pub mod import;
pub mod limits;
pub mod mail;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payment;
pub mod sync;
pub mod tasks;
pub mod wal;
