//! Network masters for the replication loop

mod http;

pub use http::HttpMaster;
