pub mod body;
pub mod capture;
pub mod codec;
pub mod config;
pub mod event_log;
pub mod filter;
pub mod inspector;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod repeater;
pub mod replay;
pub mod transport;
