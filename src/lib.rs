pub mod app;
pub mod callrecord;
pub mod config;
pub mod console;
pub mod correlation;
pub mod hep;
pub mod repository;
pub mod rtcp;
pub mod server;
pub mod sip;
pub mod utils;
pub mod version;
