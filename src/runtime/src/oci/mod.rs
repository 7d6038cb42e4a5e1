//! OCI image support.
//!
//! Images are kept as OCI image layouts:
//!
//! ```text
//! image/
//! ├── oci-layout
//! ├── index.json
//! └── blobs/sha256/
//!     ├── <manifest>
//!     ├── <config>
//!     └── <layers>
//! ```

pub mod build;
pub mod image;
pub mod layers;
pub mod pull;
pub mod reference;
pub mod registry;
pub mod store;

pub use build::{BuildConfig, BuildResult, Builder, Dockerfile, Instruction, Recipe};
pub use image::{write_layout, OciImage, OciImageConfig};
pub use layers::{extract_layer, extract_layers};
pub use pull::{BaseImageSource, ImagePuller, StoreSource};
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryPuller};
pub use store::{ImageOrigin, ImageStore, StoredImage};
