// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of the binary images loaded in the process, keyed by load address.
//!
//! Writers run in ordinary code, from module load and unload notifications. Readers run inside a
//! fault handler and must neither block nor allocate. The registry is a singly linked list:
//! - insertion builds a node and publishes it with one store to `head`;
//! - removal marks the node, unlinks it, and moves it to a retired list;
//! - retired nodes are freed by a later writer once no reader is active.
//!
//! Writers are serialized with a mutex. Readers never touch it.

use serde::{Deserialize, Serialize};
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Release, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub load_address: usize,
    pub path: String,
}

/// A borrowed view of one registry entry, valid while the snapshot that produced it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRef<'a> {
    pub load_address: usize,
    pub path: &'a str,
}

impl ImageRef<'_> {
    pub fn to_descriptor(&self) -> ImageDescriptor {
        ImageDescriptor {
            load_address: self.load_address,
            path: self.path.to_string(),
        }
    }
}

struct ImageNode {
    load_address: usize,
    path: Box<str>,
    removed: AtomicBool,
    next: AtomicPtr<ImageNode>,
}

struct RetiredNodes(Vec<*mut ImageNode>);

// SAFETY: The raw pointers are only dereferenced or freed while holding the writer mutex.
unsafe impl Send for RetiredNodes {}

pub struct ImageRegistry {
    head: AtomicPtr<ImageNode>,
    readers: AtomicUsize,
    writer: Mutex<RetiredNodes>,
}

pub(crate) static IMAGE_REGISTRY: ImageRegistry = ImageRegistry::new();

/// The process-wide registry read by every report.
pub fn image_registry() -> &'static ImageRegistry {
    &IMAGE_REGISTRY
}

impl ImageRegistry {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            readers: AtomicUsize::new(0),
            writer: Mutex::new(RetiredNodes(Vec::new())),
        }
    }

    /// Records an image. A known address with the same path is a no-op; a known address with a
    /// different path replaces the previous entry.
    pub fn register(&self, load_address: usize, path: &str) {
        let mut retired = self.lock_writer();
        if let Some(existing) = self.find_live(load_address) {
            // SAFETY: Nodes reachable from `head` are only freed under the writer lock.
            if unsafe { &*existing }.path.as_ref() == path {
                return;
            }
            self.unlink(existing, &mut retired);
        }

        let node = Box::into_raw(Box::new(ImageNode {
            load_address,
            path: path.into(),
            removed: AtomicBool::new(false),
            next: AtomicPtr::new(self.head.load(Acquire)),
        }));
        self.head.store(node, SeqCst);
        self.reclaim(&mut retired);
    }

    /// Forgets the image at `load_address`. Unknown addresses are ignored.
    pub fn unregister(&self, load_address: usize) {
        let mut retired = self.lock_writer();
        if let Some(existing) = self.find_live(load_address) {
            self.unlink(existing, &mut retired);
        }
        self.reclaim(&mut retired);
    }

    /// Returns a read-only view of the registry.
    ///
    /// SIGNAL SAFETY:
    ///     Does not allocate or block. Nodes seen through the snapshot stay allocated until it is
    ///     dropped.
    pub fn snapshot_for_report(&self) -> ImageSnapshot<'_> {
        self.readers.fetch_add(1, SeqCst);
        ImageSnapshot { registry: self }
    }

    /// Owned copy of the current entries, for ordinary code and tests.
    pub fn descriptors(&self) -> Vec<ImageDescriptor> {
        let snapshot = self.snapshot_for_report();
        snapshot.iter().map(|image| image.to_descriptor()).collect()
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, RetiredNodes> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn find_live(&self, load_address: usize) -> Option<*mut ImageNode> {
        let mut cursor = self.head.load(Acquire);
        while !cursor.is_null() {
            // SAFETY: Called with the writer lock held, so no node reachable from `head` is freed.
            let node = unsafe { &*cursor };
            if node.load_address == load_address && !node.removed.load(Acquire) {
                return Some(cursor);
            }
            cursor = node.next.load(Acquire);
        }
        None
    }

    /// Must be called with the writer lock held.
    fn unlink(&self, target: *mut ImageNode, retired: &mut RetiredNodes) {
        // SAFETY: `target` was found from `head` under the writer lock.
        let target_ref = unsafe { &*target };
        target_ref.removed.store(true, SeqCst);
        let successor = target_ref.next.load(Acquire);

        if self.head.load(Acquire) == target {
            self.head.store(successor, SeqCst);
        } else {
            let mut cursor = self.head.load(Acquire);
            while !cursor.is_null() {
                // SAFETY: as above.
                let node = unsafe { &*cursor };
                let next = node.next.load(Acquire);
                if next == target {
                    node.next.store(successor, SeqCst);
                    break;
                }
                cursor = next;
            }
        }
        retired.0.push(target);
    }

    /// Frees retired nodes if no reader is active.
    /// A reader that starts after the unlink can no longer reach a retired node, and a reader
    /// that started before it holds `readers` above zero.
    fn reclaim(&self, retired: &mut RetiredNodes) {
        if retired.0.is_empty() || self.readers.load(SeqCst) != 0 {
            return;
        }
        for node in retired.0.drain(..) {
            // SAFETY: Produced by `Box::into_raw` in `register` and unreachable from `head`.
            drop(unsafe { Box::from_raw(node) });
        }
    }
}

impl Default for ImageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ImageRegistry {
    fn drop(&mut self) {
        let retired = std::mem::take(&mut self.lock_writer().0);
        for node in retired {
            // SAFETY: `&mut self` guarantees there are no readers.
            drop(unsafe { Box::from_raw(node) });
        }
        let mut cursor = self.head.swap(ptr::null_mut(), SeqCst);
        while !cursor.is_null() {
            // SAFETY: as above.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next.load(Acquire);
        }
    }
}

/// Read guard over the registry.
pub struct ImageSnapshot<'a> {
    registry: &'a ImageRegistry,
}

impl<'a> ImageSnapshot<'a> {
    pub fn iter(&self) -> ImageIter<'_> {
        ImageIter {
            cursor: self.registry.head.load(SeqCst),
            _snapshot: self,
        }
    }
}

impl Drop for ImageSnapshot<'_> {
    fn drop(&mut self) {
        self.registry.readers.fetch_sub(1, Release);
    }
}

pub struct ImageIter<'s> {
    cursor: *mut ImageNode,
    _snapshot: &'s ImageSnapshot<'s>,
}

impl<'s> Iterator for ImageIter<'s> {
    type Item = ImageRef<'s>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.cursor.is_null() {
            // SAFETY: The snapshot keeps `readers` above zero, so nodes are not freed.
            let node: &'s ImageNode = unsafe { &*self.cursor };
            self.cursor = node.next.load(SeqCst);
            if !node.removed.load(SeqCst) {
                return Some(ImageRef {
                    load_address: node.load_address,
                    path: &node.path,
                });
            }
        }
        None
    }
}

/// Seeds the process-wide registry with every image the dynamic loader knows about.
#[cfg(target_os = "linux")]
pub fn register_loaded_images() -> usize {
    let images = loader::loaded_images();
    for image in &images {
        IMAGE_REGISTRY.register(image.load_address, &image.path);
    }
    tracing::debug!(count = images.len(), "Registered loaded images");
    images.len()
}

/// Subscribes the process-wide registry to dyld image notifications.
/// dyld replays the notification for every image already loaded.
#[cfg(target_os = "macos")]
pub fn register_loaded_images() -> usize {
    use std::sync::Once;
    static SUBSCRIBE: Once = Once::new();
    SUBSCRIBE.call_once(|| {
        // SAFETY: The callbacks have the signature dyld expects and live for the process.
        unsafe {
            loader::_dyld_register_func_for_add_image(loader::on_image_added);
            loader::_dyld_register_func_for_remove_image(loader::on_image_removed);
        }
    });
    let count = IMAGE_REGISTRY.descriptors().len();
    tracing::debug!(count, "Subscribed to dyld image notifications");
    count
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn register_loaded_images() -> usize {
    0
}

#[cfg(target_os = "linux")]
mod loader {
    use super::ImageDescriptor;
    use std::ffi::CStr;

    pub(super) fn loaded_images() -> Vec<ImageDescriptor> {
        let mut images: Vec<ImageDescriptor> = Vec::new();
        // SAFETY: The callback only touches `images` through the pointer passed back to it.
        unsafe {
            libc::dl_iterate_phdr(
                Some(visit),
                &mut images as *mut Vec<ImageDescriptor> as *mut libc::c_void,
            );
        }
        images
    }

    unsafe extern "C" fn visit(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let images = &mut *(data as *mut Vec<ImageDescriptor>);
        let info = &*info;

        let mut lowest_vaddr = None;
        for i in 0..info.dlpi_phnum as usize {
            let phdr = &*info.dlpi_phdr.add(i);
            if phdr.p_type == libc::PT_LOAD {
                let vaddr = phdr.p_vaddr as usize;
                lowest_vaddr = Some(lowest_vaddr.map_or(vaddr, |v: usize| v.min(vaddr)));
            }
        }
        let load_address = (info.dlpi_addr as usize).wrapping_add(lowest_vaddr.unwrap_or(0));

        let name = if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };
        // The main executable is reported with an empty name.
        let path = if name.is_empty() && images.is_empty() {
            std::env::current_exe()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            name
        };
        if !path.is_empty() {
            images.push(ImageDescriptor { load_address, path });
        }
        0
    }
}

#[cfg(target_os = "macos")]
mod loader {
    use super::IMAGE_REGISTRY;
    use std::ffi::CStr;

    #[repr(C)]
    pub struct MachHeader {
        _private: [u8; 0],
    }

    extern "C" {
        pub fn _dyld_register_func_for_add_image(
            func: unsafe extern "C" fn(mh: *const MachHeader, vmaddr_slide: libc::intptr_t),
        );
        pub fn _dyld_register_func_for_remove_image(
            func: unsafe extern "C" fn(mh: *const MachHeader, vmaddr_slide: libc::intptr_t),
        );
    }

    pub unsafe extern "C" fn on_image_added(mh: *const MachHeader, _slide: libc::intptr_t) {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(mh as *const libc::c_void, &mut info) == 0 || info.dli_fname.is_null() {
            return;
        }
        let path = CStr::from_ptr(info.dli_fname).to_string_lossy();
        IMAGE_REGISTRY.register(mh as usize, &path);
    }

    pub unsafe extern "C" fn on_image_removed(mh: *const MachHeader, _slide: libc::intptr_t) {
        IMAGE_REGISTRY.unregister(mh as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn contents(registry: &ImageRegistry) -> BTreeSet<(usize, String)> {
        registry
            .descriptors()
            .into_iter()
            .map(|d| (d.load_address, d.path))
            .collect()
    }

    #[test]
    fn test_register_unregister() {
        let registry = ImageRegistry::new();
        registry.register(0x1000, "/usr/lib/liba.so");
        registry.register(0x2000, "/usr/lib/libb.so");
        registry.register(0x3000, "/usr/lib/libc.so");
        registry.unregister(0x2000);

        let expected = BTreeSet::from([
            (0x1000, "/usr/lib/liba.so".to_string()),
            (0x3000, "/usr/lib/libc.so".to_string()),
        ]);
        assert_eq!(contents(&registry), expected);
    }

    #[test]
    fn test_upsert_and_unknown_unregister() {
        let registry = ImageRegistry::new();
        registry.register(0x1000, "/usr/lib/liba.so");
        registry.register(0x1000, "/usr/lib/liba.so");
        assert_eq!(registry.descriptors().len(), 1);

        registry.register(0x1000, "/usr/lib/liba-renamed.so");
        assert_eq!(
            registry.descriptors(),
            vec![ImageDescriptor {
                load_address: 0x1000,
                path: "/usr/lib/liba-renamed.so".to_string()
            }]
        );

        registry.unregister(0xdead);
        assert_eq!(registry.descriptors().len(), 1);
        registry.unregister(0x1000);
        assert!(registry.descriptors().is_empty());
    }

    #[test]
    fn test_snapshot_keeps_removed_nodes_alive() {
        let registry = ImageRegistry::new();
        registry.register(0x1000, "/usr/lib/liba.so");
        registry.register(0x2000, "/usr/lib/libb.so");

        let snapshot = registry.snapshot_for_report();
        let mut iter = snapshot.iter();
        let first = iter.next();
        // Removing while a reader is mid-traversal must not free the nodes it can reach.
        registry.unregister(0x2000);
        registry.unregister(0x1000);
        let seen: Vec<_> = first.into_iter().chain(iter).map(|i| i.path).collect();
        assert!(seen.contains(&"/usr/lib/libb.so"));
        drop(snapshot);

        assert!(registry.descriptors().is_empty());
        // The next writer frees the retired nodes.
        registry.register(0x3000, "/usr/lib/libc.so");
        assert_eq!(registry.lock_writer().0.len(), 0);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let registry = Arc::new(ImageRegistry::new());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..200usize {
                        let addr = (t << 16) | i;
                        registry.register(addr, &format!("/lib/{t}/{i}.so"));
                        if i % 2 == 0 {
                            registry.unregister(addr);
                        }
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snapshot = registry.snapshot_for_report();
                        for image in snapshot.iter() {
                            assert!(image.path.starts_with("/lib/"));
                        }
                    }
                })
            })
            .collect();
        for h in writers.into_iter().chain(readers) {
            assert!(h.join().is_ok());
        }
        assert_eq!(registry.descriptors().len(), 4 * 100);
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_loader_lists_main_executable() -> anyhow::Result<()> {
        let images = loader::loaded_images();
        let exe = std::env::current_exe()?;
        assert!(images
            .iter()
            .any(|i| i.path == exe.to_string_lossy().as_ref()));
        assert!(images.iter().any(|i| i.path.contains("libc")));
        Ok(())
    }
}
