pub mod config;
pub mod debug_sink;
pub mod fetcher;
pub mod notifier;
pub mod parser;
pub mod pipeline;
pub mod store;
pub mod subscriptions;
pub mod types;

pub use config::Config;
pub use pipeline::Orchestrator;

pub(crate) const BASE_URL: &str = "https://minfin.com.ua/currency/banks/";
