#![doc = include_str!("../Readme.md")]
#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

pub mod app;
pub mod config;
pub mod ethereum;
pub mod monitor;
pub mod nine;
pub mod notify;
pub mod observer;
pub mod policy;
pub mod secret;
pub mod server;
pub mod signer;
pub mod store;

pub use app::App;
pub use config::Config;
