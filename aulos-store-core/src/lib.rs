//! Domain types shared by the aulos store crates: store paths, hashes,
//! content addresses, derivations and the NAR stream copier.
//!
//! Everything in here is protocol-independent; the wire encodings live in
//! `aulos-store-remote`.

pub mod base32;
pub mod build;
pub mod content_address;
pub mod derivation;
pub mod derived_path;
pub mod file_ingestion;
pub mod gc;
pub mod hash;
pub mod missing;
pub mod nar;
pub mod path_info;
pub mod store_path;
pub mod substitutable;

pub use build::{BuildMode, BuildResult, BuildStatus};
pub use content_address::{ContentAddress, ContentAddressError, ContentAddressMethod};
pub use derivation::{Derivation, DerivationOutput, DerivationParseError};
pub use derived_path::{ParseDerivedPathError, StorePathWithOutputs};
pub use file_ingestion::FileIngestionMethod;
pub use gc::{GcAction, GcOptions, GcResults, Roots};
pub use hash::{Hash, HashAlgo, ParseHashError};
pub use missing::Missing;
pub use nar::{copy_nar, NarCopyError};
pub use path_info::ValidPathInfo;
pub use store_path::{ParseStorePathError, StoreDir, StorePath};
pub use substitutable::{SubstitutablePathInfo, SubstitutablePathInfos};
