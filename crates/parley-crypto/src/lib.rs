/// Parley Crypto Library
///
/// At-rest sealing of message text and translations with AES-256-GCM under a
/// single server-managed key. The server can always read what it seals; this
/// protects database files and backups, not messages in transit.

pub mod encrypt;
pub mod keys;

pub use encrypt::{Sealed, TextCipher};
