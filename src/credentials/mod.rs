//! 凭据：AuthBundle 与加密存储

mod bundle;
mod cipher;
mod store;

pub use bundle::{AuthBundle, COOKIE_PREFIX};
pub use cipher::{derive_key, KeySource, StoreCipher};
pub use store::CredentialStore;
