//! Data exchanged between the engine's components and with peers

mod character;
mod peer;
mod snapshot;
mod transfer;

pub use character::{CharacterData, FileReplacement};
pub use peer::PeerRelationship;
pub use snapshot::{merge_assets, AssetDescriptor, CharacterSnapshot, ObjectKind};
pub use transfer::{Direction, TransferTicket};
