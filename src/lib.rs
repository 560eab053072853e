pub mod cassette;
pub mod config;
pub mod context;
pub mod errors;
pub mod grpc;
pub mod http;
pub mod httpwire;
pub mod logging;
pub mod middleware;
pub mod mode;
pub mod record;
pub mod recorder;
pub mod registry;
pub mod result;
pub mod service;
pub mod sql;
pub mod writer;
