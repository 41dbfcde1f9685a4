//! Per-object asynchronous I/O state machine for a cloned block-storage client.
//!
//! An image's logical address space is striped across many fixed-size backing
//! objects in an external object store. A clone's unmaterialised regions are
//! served transparently from its parent image until a read or write forces
//! materialisation ("copyup"). This crate implements the request engine that
//! drives one read or write against one backing object: [`aio::AioRead`] and
//! [`aio::AbstractWrite`], coordinated through [`copyup::CopyupCoordinator`]
//! and guarded by [`object_map::ObjectMap`].
//!
//! Everything outside this core (the image-level API, the striping layout
//! calculator, the object-store wire protocol, the exclusive-lock protocol)
//! is consumed through the abstract interfaces in [`extent`], [`object_map`],
//! [`object_store`] and [`parent`], not implemented here.

pub mod aio;
pub mod copyup;
pub mod error;
pub mod extent;
pub mod image;
pub mod object_map;
pub mod object_store;
pub mod parent;

#[cfg(any(test, feature = "testing"))]
pub mod testutil;

pub use aio::{AbstractWrite, AioRead, WritePayload};
pub use error::{CloneIoError, Result};
pub use extent::Extent;
pub use image::ImageContext;
