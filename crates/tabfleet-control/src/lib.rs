pub mod config;
pub mod error;
pub mod instances;
pub mod profiles;
pub mod proxy;
pub mod reporter;
pub mod routes;
pub mod runtime;
pub mod security;
pub mod state;
pub mod tabs;
pub mod tunnel;
