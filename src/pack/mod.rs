//! Pack File Formats
//!
//! Parsers for the two whole-object index files that sit next to a pack:
//! the object index and the reachability bitmap index.

pub mod bitmap;
pub mod index;

pub use bitmap::{BitmapEntry, EwahBitmap, PackBitmapIndex};
pub use index::{IndexEntry, ObjectId, PackIndex};
