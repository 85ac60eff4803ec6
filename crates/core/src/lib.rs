//! Courier Core Library
//!
//! Boundary types shared across the Courier transport stack: the generic
//! tagged [`Value`], the ETF wire codec over it, the HTTP workload/response
//! boundary types, and client configuration.

pub mod config;
pub mod etf;
pub mod value;
pub mod workload;

pub use config::ClientConfig;
pub use etf::{decode, encode, EtfError};
pub use value::Value;
pub use workload::{
    EndpointClass, HttpMethod, HttpResponse, HttpWorkload, PayloadKind,
};
