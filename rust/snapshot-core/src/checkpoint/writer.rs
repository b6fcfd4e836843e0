// rust/snapshot-core/src/checkpoint/writer.rs

//! Region writer implementation.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::config::WriterConfig;
use crate::error::{EngineError, Result};
use crate::serialize::LENGTH_WORD_SIZE;

use super::layout::CheckpointLayout;
use super::region::RegionDescriptor;

/// Copies a checkpoint layout into an already allocated region.
///
/// The call is all-or-nothing from the engine's point of view: any error
/// means the region must not be committed.
pub trait RegionWriter: Send + Sync {
    /// Writes `layout` into the first `layout.total_size` bytes of `region`.
    ///
    /// # Errors
    ///
    /// Returns `WriterFailure` if the region cannot be opened, is smaller
    /// than `total_size`, or the copy does not end exactly at `total_size`.
    fn write(&self, path: &Path, layout: &CheckpointLayout, region: &RegionDescriptor) -> Result<()>;
}

/// Writes regions through `/proc/<pid>/fd/<fd>` with a shared mapping.
///
/// Storages above `parallel_threshold` bytes are split across
/// `copy_threads` scoped threads.
#[derive(Debug, Clone)]
pub struct ProcRegionWriter {
    copy_threads: usize,
    parallel_threshold: usize,
}

impl ProcRegionWriter {
    pub fn new(config: &WriterConfig) -> Self {
        Self {
            copy_threads: config.copy_threads.max(1),
            parallel_threshold: config.parallel_threshold,
        }
    }
}

impl Default for ProcRegionWriter {
    fn default() -> Self {
        Self::new(&WriterConfig::default())
    }
}

impl RegionWriter for ProcRegionWriter {
    fn write(&self, path: &Path, layout: &CheckpointLayout, region: &RegionDescriptor) -> Result<()> {
        let proc_path = region.proc_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&proc_path)
            .map_err(|e| {
                EngineError::writer_with_source(
                    path,
                    format!("failed to open region {}", proc_path.display()),
                    e,
                )
            })?;

        let region_len = file
            .metadata()
            .map_err(|e| EngineError::writer_with_source(path, "failed to stat region", e))?
            .len();
        if region_len < layout.total_size {
            return Err(EngineError::writer(
                path,
                format!(
                    "region {region} holds {region_len} bytes, checkpoint needs {}",
                    layout.total_size
                ),
            ));
        }

        // SAFETY: the region was allocated for this checkpoint and stays
        // PENDING, so no reader maps it until the write is committed.
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| EngineError::writer_with_source(path, "failed to map region", e))?;

        // Bytes past total_size belong to the region's rounding and stay untouched.
        let dst = &mut map[..layout.total_size as usize];
        let written = copy_layout(dst, layout, self.copy_threads, self.parallel_threshold)
            .map_err(|message| EngineError::writer(path, message))?;

        map.flush()
            .map_err(|e| EngineError::writer_with_source(path, "failed to flush region", e))?;

        tracing::debug!(
            path = %path.display(),
            %region,
            bytes = written,
            "copied checkpoint into shared memory"
        );
        Ok(())
    }
}

/// Lays `layout` out in `dst` and returns the number of bytes written.
pub(crate) fn copy_layout(
    dst: &mut [u8],
    layout: &CheckpointLayout,
    threads: usize,
    parallel_threshold: usize,
) -> std::result::Result<u64, String> {
    if dst.len() as u64 != layout.total_size {
        return Err(format!(
            "destination holds {} bytes, layout needs {}",
            dst.len(),
            layout.total_size
        ));
    }
    if layout.metadata.len() > dst.len() {
        return Err("metadata does not fit in region".to_string());
    }

    let (meta_dst, mut rest) = dst.split_at_mut(layout.metadata.len());
    meta_dst.copy_from_slice(&layout.metadata);
    let mut offset = layout.metadata.len() as u64;

    for reference in &layout.references {
        let needed = LENGTH_WORD_SIZE + reference.nbytes;
        if rest.len() < needed || reference.data.len() != reference.nbytes {
            return Err(format!(
                "storage {} overruns the region at offset {offset}",
                reference.key
            ));
        }
        let (word, tail) = std::mem::take(&mut rest).split_at_mut(LENGTH_WORD_SIZE);
        word.copy_from_slice(&reference.numel.to_ne_bytes());
        let (data, tail) = tail.split_at_mut(reference.nbytes);
        parallel_copy(data, &reference.data, threads, parallel_threshold);
        rest = tail;
        offset += needed as u64;
    }

    if offset != layout.total_size {
        return Err(format!(
            "copy ended at offset {offset}, expected {}",
            layout.total_size
        ));
    }
    Ok(offset)
}

fn parallel_copy(dst: &mut [u8], src: &[u8], threads: usize, threshold: usize) {
    if threads <= 1 || src.len() < threshold || src.len() < threads {
        dst.copy_from_slice(src);
        return;
    }

    let chunk = src.len().div_ceil(threads);
    std::thread::scope(|scope| {
        for (d, s) in dst.chunks_mut(chunk).zip(src.chunks(chunk)) {
            scope.spawn(move || d.copy_from_slice(s));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::DataReference;
    use crate::graph::{Buffer, Value};
    use crate::serialize::{deserialize_image, serialize};

    fn sample_layout() -> CheckpointLayout {
        let graph = Value::dict([
            ("a", Value::Buffer(Buffer::from_f32(&[1.0; 64]))),
            ("b", Value::Buffer(Buffer::from_f32(&[2.0; 3]))),
        ]);
        let (metadata, refs) = serialize(&graph).unwrap();
        CheckpointLayout::new(Path::new("w.pt"), metadata, refs).unwrap()
    }

    #[test]
    fn test_copy_layout_matches_image() {
        let layout = sample_layout();
        let mut dst = vec![0u8; layout.total_size as usize];

        let written = copy_layout(&mut dst, &layout, 1, usize::MAX).unwrap();

        assert_eq!(written, layout.total_size);
        assert_eq!(dst, layout.to_image());
    }

    #[test]
    fn test_parallel_copy_matches_serial() {
        let layout = sample_layout();
        let mut serial = vec![0u8; layout.total_size as usize];
        let mut parallel = vec![0u8; layout.total_size as usize];

        copy_layout(&mut serial, &layout, 1, usize::MAX).unwrap();
        copy_layout(&mut parallel, &layout, 4, 1).unwrap();

        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_copy_layout_rejects_wrong_size() {
        let layout = sample_layout();
        let mut dst = vec![0u8; layout.total_size as usize + 1];

        assert!(copy_layout(&mut dst, &layout, 1, usize::MAX).is_err());
    }

    #[test]
    fn test_copy_layout_rejects_inconsistent_reference() {
        let mut layout = sample_layout();
        layout.references[0] = DataReference {
            nbytes: layout.references[0].nbytes + 4,
            ..layout.references[0].clone()
        };
        let mut dst = vec![0u8; layout.total_size as usize];

        assert!(copy_layout(&mut dst, &layout, 1, usize::MAX).is_err());
    }

    #[test]
    fn test_write_to_missing_region_fails() {
        let layout = sample_layout();
        let region = RegionDescriptor::new(std::process::id(), 1 << 30);

        let result = ProcRegionWriter::default().write(Path::new("w.pt"), &layout, &region);
        assert!(matches!(result, Err(EngineError::WriterFailure { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_into_memfd() {
        use crate::checkpoint::region::create_memfd;
        use std::io::Read;
        use std::os::fd::AsRawFd;

        let layout = sample_layout();
        let mut file = create_memfd("writer-test", layout.total_size).unwrap();
        let region = RegionDescriptor::new(std::process::id(), file.as_raw_fd());

        ProcRegionWriter::default()
            .write(Path::new("w.pt"), &layout, &region)
            .unwrap();

        let mut image = Vec::new();
        file.read_to_end(&mut image).unwrap();
        assert_eq!(image, layout.to_image());

        let restored = deserialize_image(image.into()).unwrap();
        let a = restored.get("a").and_then(Value::as_buffer).unwrap();
        assert_eq!(a.to_f32_vec().unwrap(), vec![1.0; 64]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_into_oversized_region() {
        use crate::checkpoint::region::create_memfd;
        use std::io::Read;
        use std::os::fd::AsRawFd;

        let layout = sample_layout();
        let page_rounded = layout.total_size.next_multiple_of(4096) + 4096;
        let mut file = create_memfd("rounded-region", page_rounded).unwrap();
        let region = RegionDescriptor::new(std::process::id(), file.as_raw_fd());

        ProcRegionWriter::default()
            .write(Path::new("w.pt"), &layout, &region)
            .unwrap();

        let mut image = Vec::new();
        file.read_to_end(&mut image).unwrap();
        assert_eq!(image.len() as u64, page_rounded);
        let (written, tail) = image.split_at(layout.total_size as usize);
        assert_eq!(written, &layout.to_image()[..]);
        assert!(tail.iter().all(|&b| b == 0));

        let restored = deserialize_image(image.into()).unwrap();
        let b = restored.get("b").and_then(Value::as_buffer).unwrap();
        assert_eq!(b.to_f32_vec().unwrap(), vec![2.0; 3]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_into_undersized_region_fails() {
        use crate::checkpoint::region::create_memfd;
        use std::os::fd::AsRawFd;

        let layout = sample_layout();
        let file = create_memfd("short-region", layout.total_size - 1).unwrap();
        let region = RegionDescriptor::new(std::process::id(), file.as_raw_fd());

        let result = ProcRegionWriter::default().write(Path::new("w.pt"), &layout, &region);
        assert!(matches!(result, Err(EngineError::WriterFailure { .. })));
    }
}
