pub mod audit;
pub mod diff;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod models;
pub mod permissions;
pub mod store;
