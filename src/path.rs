//! Path factory: names files. Modeled as a trait with a default
//! implementation, grounded on `motedb::storage::lsm::engine`'s
//! `l{level}_{id:06}.sst` naming scheme in `flush_immutable_impl`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait PathFactory: Send + Sync {
    /// Generates a fresh, unique file path for a (partition, bucket, level)
    /// tuple.
    fn new_path(&self, partition: &str, bucket: u32, level: usize) -> PathBuf;
}

/// Names files `{root}/{partition}/bucket-{bucket}/L{level}/{seq:08}.data`,
/// with the trailing sequence counted per process to guarantee uniqueness
/// without a UUID dependency.
pub struct DefaultPathFactory {
    root: PathBuf,
    next_id: AtomicU64,
}

impl DefaultPathFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), next_id: AtomicU64::new(0) }
    }
}

impl PathFactory for DefaultPathFactory {
    fn new_path(&self, partition: &str, bucket: u32, level: usize) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(partition)
            .join(format!("bucket-{bucket}"))
            .join(format!("L{level}"))
            .join(format!("{id:08}.data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_paths_are_unique_and_named_by_level() {
        let factory = DefaultPathFactory::new("/tmp/root");
        let a = factory.new_path("p0", 3, 0);
        let b = factory.new_path("p0", 3, 0);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().contains("L0"));
        assert!(a.to_string_lossy().contains("bucket-3"));
    }
}
