pub mod broker;
pub mod client;
pub mod domo_config;
pub mod protocol;
pub mod worker;
