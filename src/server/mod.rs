pub mod auth;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod events;
pub mod group_messages;
pub mod groups;
pub mod hub;
pub mod messages;
pub mod notifications;
pub mod presence;
pub mod users;
pub mod websocket;
