//! Mirrored devices, and the root device's handling of block copies.
//!
//! A mirror keeps one copy of the block on each child at the same offset.
//! The root device uses the same logic across a block pointer's DVAs, one
//! copy per top-level device.

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::common::exception::ZioError;
use crate::storage::zio::construct::{self, ZioArgs};
use crate::storage::zio::executor;
use crate::storage::zio::request::Callback;
use crate::storage::zio::{ActiveZio, ZioFlags, ZioType};

use super::{Vdev, VdevOps};

struct MirrorChild {
    vd: Option<Arc<Vdev>>,
    offset: u64,
    tried: bool,
    error: Option<ZioError>,
}

/// Per-request record of which copies were tried and how they fared.
pub struct MirrorMap {
    children: Mutex<Vec<MirrorChild>>,
}

impl MirrorMap {
    fn new(children: Vec<(Option<Arc<Vdev>>, u64)>) -> Self {
        Self {
            children: Mutex::new(
                children
                    .into_iter()
                    .map(|(vd, offset)| MirrorChild {
                        vd,
                        offset,
                        tried: false,
                        error: None,
                    })
                    .collect(),
            ),
        }
    }

    /// Records the outcome of the child I/O issued for copy `index`.
    pub(crate) fn record(&self, index: usize, error: Option<ZioError>) {
        if let Some(child) = self.children.lock().get_mut(index) {
            child.error = error;
        }
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the first untried readable copy and marks it tried. Copies on
    /// missing or inaccessible devices are marked failed along the way.
    fn next_readable(&self) -> Option<usize> {
        let mut children = self.children.lock();
        for (i, child) in children.iter_mut().enumerate() {
            if child.tried {
                continue;
            }
            child.tried = true;
            match &child.vd {
                Some(vd) if vd.is_accessible() => return Some(i),
                _ => child.error = Some(ZioError::DeviceUnavailable),
            }
        }
        None
    }

    fn target(&self, index: usize) -> Option<(Arc<Vdev>, u64)> {
        let children = self.children.lock();
        let child = children.get(index)?;
        child.vd.as_ref().map(|vd| (Arc::clone(vd), child.offset))
    }

    fn worst_error(&self) -> Option<ZioError> {
        self.children
            .lock()
            .iter()
            .filter(|c| c.tried)
            .fold(None, |worst, c| ZioError::worst(worst, c.error.clone()))
    }

    fn good_copies(&self) -> usize {
        self.children
            .lock()
            .iter()
            .filter(|c| c.tried && c.error.is_none())
            .count()
    }

    /// Copies that were read and failed, to be rewritten from a good one.
    fn failed_reads(&self) -> Vec<usize> {
        self.children
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.tried && c.vd.is_some() && c.error.is_some())
            .filter(|(_, c)| c.error != Some(ZioError::DeviceUnavailable))
            .map(|(i, _)| i)
            .collect()
    }

    fn mark_all_tried(&self) -> Vec<usize> {
        let mut children = self.children.lock();
        let mut issued = Vec::with_capacity(children.len());
        for (i, child) in children.iter_mut().enumerate() {
            child.tried = true;
            if child.vd.is_some() {
                issued.push(i);
            } else {
                child.error = Some(ZioError::DeviceUnavailable);
            }
        }
        issued
    }
}

/// Ops shared by mirror devices and the pool's root device.
pub struct MirrorOps;

impl MirrorOps {
    fn map_for(zio: &ActiveZio<'_>) -> MirrorMap {
        match zio.vd() {
            Some(vd) => MirrorMap::new(
                vd.children()
                    .iter()
                    .map(|c| (Some(Arc::clone(c)), zio.offset()))
                    .collect(),
            ),
            None => {
                let dvas = zio.bp().map(|bp| bp.dvas.clone()).unwrap_or_default();
                MirrorMap::new(
                    dvas.iter()
                        .map(|dva| (zio.spa.vdev(dva.vdev), dva.offset))
                        .collect(),
                )
            }
        }
    }

    fn issue_child(
        zio: &mut ActiveZio<'_>,
        map: &Arc<MirrorMap>,
        index: usize,
        io_type: ZioType,
        flags: ZioFlags,
    ) {
        let Some((vd, offset)) = map.target(index) else {
            return;
        };
        trace!(
            "{}: {:?} copy {} on vdev {} at {:#x}",
            zio.id(),
            io_type,
            index,
            vd.id(),
            offset
        );
        let args = ZioArgs::vdev_child(io_type, vd, offset, zio.data().clone(), zio.size())
            .flags(flags)
            .on_done(Callback::MirrorChild {
                map: Arc::clone(map),
                index,
            });
        let spa = zio.spa;
        let child = construct::vdev_child_io(zio, args);
        executor::nowait(spa, &child);
    }
}

impl VdevOps for MirrorOps {
    fn io_start(&self, zio: &mut ActiveZio<'_>) {
        let map = Arc::new(Self::map_for(zio));
        zio.set_vsd(Arc::clone(&map));

        match zio.io_type() {
            ZioType::Read => match map.next_readable() {
                Some(index) => Self::issue_child(zio, &map, index, ZioType::Read, ZioFlags::NONE),
                None => zio.set_error(Some(ZioError::DeviceUnavailable)),
            },
            ZioType::Write | ZioType::Trim => {
                let io_type = zio.io_type();
                for index in map.mark_all_tried() {
                    Self::issue_child(zio, &map, index, io_type, ZioFlags::NONE);
                }
            }
            _ => zio.set_error(Some(ZioError::NotSupported)),
        }
    }

    fn io_done(&self, zio: &mut ActiveZio<'_>) {
        let Some(map) = zio.vsd() else {
            return;
        };
        if map.is_empty() {
            zio.set_error(Some(ZioError::DeviceUnavailable));
            return;
        }

        match zio.io_type() {
            ZioType::Read => {
                if map.good_copies() == 0 {
                    // Try the next copy and come back here when it is done.
                    if let Some(index) = map.next_readable() {
                        Self::issue_child(zio, &map, index, ZioType::Read, ZioFlags::NONE);
                        zio.redo_io_done();
                        return;
                    }
                    zio.set_error(map.worst_error());
                    return;
                }
                zio.set_error(None);

                if zio.flags().contains(ZioFlags::SPECULATIVE) {
                    return;
                }
                for index in map.failed_reads() {
                    debug!("{}: repairing copy {} from a good one", zio.id(), index);
                    Self::issue_child(
                        zio,
                        &map,
                        index,
                        ZioType::Write,
                        ZioFlags::IO_REPAIR | ZioFlags::SELF_HEAL,
                    );
                }
            }
            _ => {
                if map.good_copies() == 0 {
                    zio.set_error(map.worst_error());
                } else {
                    zio.set_error(None);
                }
            }
        }
    }
}
