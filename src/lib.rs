//! vaultcore - Per-user encrypted file vault
//!
//! Files are encrypted at rest with their own key, listed and downloaded
//! (transparently decrypted) by their owner, and bulk-exported as one ZIP
//! archive. Plaintext only ever touches disk inside staging roots, and every
//! staged file is removed when the operation that created it ends.

pub mod archive;
pub mod config;
pub mod crypto;
pub mod error;
pub mod record;
pub mod staging;
pub mod vault;

pub use config::VaultConfig;
pub use error::{Error, ErrorKind, Result};
pub use vault::{DecryptedFile, VaultService};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::archive::ArchiveStream;
    pub use crate::config::VaultConfig;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::record::{FileRecord, FileRecordStore};
    pub use crate::vault::{DecryptedFile, VaultService};
}
