mod device;
mod store;

pub use device::{ApiKey, Device, DeviceStatus};
pub use store::{SqliteMetadataStore, StoreError};
