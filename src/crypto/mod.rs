//! Cryptography module for vaultcore
//!
//! Provides per-file AES-256-CBC encryption streamed through bounded
//! buffers, with one random key and IV for every stored blob.

mod keys;
mod stream;

pub use keys::KeyMaterial;
pub use stream::StreamCipher;

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of CBC initialization vector in bytes
pub const IV_SIZE: usize = 16;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Default streaming chunk size: 64KB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest accepted streaming chunk: 16MB
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
