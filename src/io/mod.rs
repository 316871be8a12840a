//! Network IO: HTTP contract, repository sync and artifact download.

pub mod download;
pub mod http;
pub mod sync;
