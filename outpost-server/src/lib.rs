//! Server side of the outpost position uplink.
//!
//! Receives sealed batches at a single CoAP resource, decrypts and decodes
//! them, and hands the reconstructed fixes to a storage sink. The server
//! is stateless between requests beyond the sink handle and the key, so it
//! scales horizontally by sharing the pre-shared key.

pub mod resource;
pub mod sink;
