//! Reversible buffer substitutions attached to a request.
//!
//! Each entry remembers the buffer and size it replaced plus how to undo the
//! substitution. Entries unwind strictly last-in first-out, so after
//! [`pop_all`] the request holds exactly the buffer it started with.

use crate::common::exception::ZioError;
use crate::storage::abd::Abd;
use crate::storage::blkptr::{CompressKind, CryptParams};
use crate::storage::{compression, crypt};

use super::types::{ZioFlags, ZioType};

#[derive(Debug, Clone)]
pub(crate) enum Undo {
    /// Write-side substitutions: the original buffer is left untouched.
    None,
    /// Padding to a sector boundary; reads copy the prefix back.
    Subblock,
    Decompress(CompressKind),
    Decrypt { key: u64, params: CryptParams },
}

#[derive(Debug)]
pub(crate) struct Transform {
    data: Abd,
    size: u64,
    undo: Undo,
}

/// Makes `data`/`size` the active buffer, remembering the current one.
pub(crate) fn push(
    transforms: &mut Vec<Transform>,
    active: &mut Abd,
    active_size: &mut u64,
    data: Abd,
    size: u64,
    undo: Undo,
) {
    let prev = std::mem::replace(active, data);
    transforms.push(Transform {
        data: prev,
        size: *active_size,
        undo,
    });
    *active_size = size;
}

/// Unwinds every transform. Undo functions run only while `error` is clear,
/// and may set it.
pub(crate) fn pop_all(
    transforms: &mut Vec<Transform>,
    active: &mut Abd,
    active_size: &mut u64,
    io_type: ZioType,
    flags: ZioFlags,
    error: &mut Option<ZioError>,
) {
    while let Some(t) = transforms.pop() {
        let transformed = std::mem::replace(active, t.data);
        let transformed_size = *active_size;
        *active_size = t.size;

        if error.is_some() {
            continue;
        }
        let restored = active.clone();
        let size = t.size as usize;
        let result = match &t.undo {
            Undo::None => Ok(()),
            Undo::Subblock => {
                if io_type == ZioType::Read {
                    restored.copy_from(&transformed, size);
                }
                Ok(())
            }
            Undo::Decompress(kind) => {
                let src = transformed.with_slice(|s| s[..transformed_size as usize].to_vec());
                restored
                    .with_slice_mut(|d| compression::decompress(*kind, &src, &mut d[..size]))
                    .map_err(|_| ZioError::Io)
            }
            Undo::Decrypt { key, params } => {
                let src = transformed.with_slice(|s| s[..transformed_size as usize].to_vec());
                restored
                    .with_slice_mut(|d| crypt::decrypt(*key, params, &src, &mut d[..size]))
                    .map_err(|e| {
                        if flags.contains(ZioFlags::SPECULATIVE) {
                            ZioError::NotFound
                        } else {
                            e
                        }
                    })
            }
        };
        if let Err(e) = result {
            *error = Some(e);
        }
    }
}
