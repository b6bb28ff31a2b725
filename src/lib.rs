pub mod clock;
pub mod config;
pub mod geofence;
pub mod logging;
pub mod relationship;
pub mod reminders;
pub mod session;
pub mod store;
