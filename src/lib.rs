pub mod aggregate;
pub mod config;
pub mod domain;
pub mod error;
pub mod export;
pub mod filter;
pub mod listing;
pub mod missing;
pub mod output;
pub mod page;
pub mod refresh;
pub mod remote;
pub mod scope;
pub mod snapshot;
pub mod store;
pub mod table;
pub mod tui;
pub mod view;
