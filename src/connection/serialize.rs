use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::marshal::NativeBuf;
use crate::provider::{DeserializeFlags, FeatureSet, OwnedBytes, Sqlite3Serialize};

use super::core::Connection;

/// Largest database a deserialized image may grow to, in bytes.
pub const MAX_DESERIALIZE_SIZE: i64 = 1024 * 1024 * 1000 * 2;

/// Engine-owned image from a copying serialize; freed on drop.
struct ImageGuard<'p, P: Sqlite3Serialize> {
    api: &'p P,
    bytes: OwnedBytes,
}

impl<P: Sqlite3Serialize> ImageGuard<'_, P> {
    fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.bytes.ptr.as_ptr(), self.bytes.len) }
    }
}

impl<P: Sqlite3Serialize> Drop for ImageGuard<'_, P> {
    fn drop(&mut self) {
        unsafe { self.api.free_image(self.bytes) };
    }
}

impl<'p, P: Sqlite3Serialize> Connection<'p, P> {
    /// Copy of the database image of `schema` (usually `"main"`).
    pub fn serialize(&self, schema: &str) -> Result<Vec<u8>> {
        if !self.api.feature_set().contains(FeatureSet::SERIALIZE) {
            return Err(Error::feature_unavailable("serialize not available"));
        }
        self.with_db(|db| {
            if let Some(view) = unsafe { self.api.serialize_borrowed(db, schema)? } {
                return Ok(unsafe { view.as_slice() }.to_vec());
            }
            match unsafe { self.api.serialize(db, schema)? } {
                Some(bytes) => {
                    let image = ImageGuard {
                        api: self.api,
                        bytes,
                    };
                    Ok(image.as_slice().to_vec())
                }
                None => Err(Error::with_message(
                    ErrorCode::NoMem,
                    "Serialization failed, allocation failed",
                )),
            }
        })
    }

    /// Replace `schema` with the image in `bytes`.
    ///
    /// The image is copied into an engine allocation the engine owns and may
    /// grow, up to [`MAX_DESERIALIZE_SIZE`].
    pub fn deserialize(&self, schema: &str, bytes: &[u8]) -> Result<()> {
        if !self.api.feature_set().contains(FeatureSet::SERIALIZE) {
            return Err(Error::feature_unavailable("deserialize not available"));
        }
        if bytes.len() as u64 > MAX_DESERIALIZE_SIZE as u64 {
            return Err(Error::with_message(
                ErrorCode::TooBig,
                format!(
                    "database image of {} bytes exceeds {MAX_DESERIALIZE_SIZE}",
                    bytes.len()
                ),
            ));
        }
        self.with_db(|db| {
            let buf = NativeBuf::copy_from(self.api, bytes)?;
            let (data, len) = buf.into_raw();
            // Ownership of `data` passes to the engine, also on failure.
            unsafe {
                self.api.deserialize(
                    db,
                    schema,
                    data,
                    len,
                    DeserializeFlags::FREE_ON_CLOSE | DeserializeFlags::RESIZEABLE,
                )?
            };
            // The new image is already live; a missing size cap is not worth failing over.
            match unsafe { self.api.set_size_limit(db, schema, MAX_DESERIALIZE_SIZE) } {
                Ok(limit) => debug!(schema, len, limit, "deserialized database image"),
                Err(err) => warn!(schema, len, error = %err, "could not cap deserialized database size"),
            }
            Ok(())
        })
    }
}
