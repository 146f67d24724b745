//! Scarce-integer allocation backed by the coordination service

mod bitmap;
mod counter;
mod index;
mod registry;

pub use bitmap::Bitmap;
pub use counter::{CounterAllocator, ScopeKey};
pub use index::{AllocatorSettings, AllocatorSpec, IndexAllocator};
pub use registry::{
    AllocatorRegistry, IdFamily, SG_ID_MIN, SG_ID_RESERVED_OWNER, SUBNET_ALLOC_PATH,
    TAG_TYPE_ID_ALLOC_PATH, TAG_TYPE_RESERVED, TAG_VALUE_ID_ALLOC_PATH, VN_ID_ALLOC_PATH,
    VN_ID_MIN,
};
