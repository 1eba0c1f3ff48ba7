//! ck_store: Encrypted local key store for Cipherkeep
//!
//! # Encryption strategy
//! SQLite does not encrypt; key material is sealed before it reaches a row:
//! - Private keys: AES-256-GCM under a key derived from a per-record
//!   password (Argon2id by default), salt and nonce stored with the blob.
//! - Conversation keys: AES-256-GCM under the session master key, which is
//!   held in memory only (see [`Session`]).
//! - Public keys, versions, timestamps and rotation reasons are plaintext.
//!
//! # Module layout
//! - [`db`]: `Store` handle, migrations, session unlock, clear
//! - [`key_pairs`]: password-sealed identity key pairs
//! - [`conversation_keys`]: master-key-wrapped conversation keys
//! - [`rotation`]: versioned key replacement and audit history
//! - [`backup`]: password-protected export / import
//! - [`session`]: in-memory master key with optional auto-lock
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on open.

pub mod backup;
pub mod config;
pub mod conversation_keys;
pub mod db;
pub mod error;
pub mod key_pairs;
pub mod lookup;
pub mod models;
pub mod rotation;
pub mod session;

pub use backup::RestoreSummary;
pub use config::StoreConfig;
pub use db::Store;
pub use error::{ErrorKind, StoreError};
pub use lookup::Lookup;
pub use session::{MasterKey, Session};
