//! Policy bundle distribution.
//!
//! Two cooperating services:
//!
//! - the **assembler** ([`assembler`]) periodically reads a set of policy and
//!   configuration files, packages them into a `.tar.gz` bundle
//!   ([`archive`]) and uploads it ([`transfer`]);
//! - the **store** ([`http`], [`store`]) keeps the latest bundle per name and
//!   serves it to consumers over HTTP.

pub mod archive;
pub mod assembler;
pub mod config;
pub mod http;
pub mod metrics;
pub mod store;
pub mod transfer;
