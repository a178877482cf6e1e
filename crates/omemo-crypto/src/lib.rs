pub mod address;
pub mod error;
pub mod identity;
pub mod payload;
pub mod prekeys;
pub mod session;
pub mod store;

pub use address::DeviceAddress;
pub use error::CryptoError;
pub use identity::IdentityKeyPair;
pub use prekeys::{PreKeyBundle, PublicPreKey};
pub use session::{SessionManager, WrappedKey};
pub use store::{CorruptStorePolicy, OmemoStore};
