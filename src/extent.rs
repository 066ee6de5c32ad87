//! Extent-mapped views of byte streams
//!
//! An extent maps a contiguous run of a logical stream onto its parent
//! stream. [`ExtentReader`] turns an extent list into a [`BlockRead`],
//! and [`compose`] collapses nested extent maps so that a chain of views
//! (partition inside image, file inside partition, image inside file, …)
//! always resolves through a single lookup against the root reader.

use std::io;
use std::sync::Arc;

use crate::block::{BlockRead, BlockWrite, SharedReader, SharedWriter};

/// A contiguous mapping from logical to physical offsets.
///
/// Bytes `[logical, logical+length)` of the logical stream live at
/// `[physical, physical+length)` of the parent stream. Extent lists are
/// sorted by `logical` and do not overlap; gaps between extents are
/// sparse regions that read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
}

/// A byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Compose two extent maps.
///
/// `outer` maps a logical stream into the coordinate space that `inner`
/// maps onwards, so `outer[i].physical` is a logical address of the inner
/// stream. The result maps the outer logical stream directly onto the
/// inner stream's parent. Where the outer map lands in an inner hole, no
/// extent is emitted and the region becomes a hole of the composed map.
pub fn compose(outer: &[Extent], inner: &[Extent]) -> Vec<Extent> {
    let mut out: Vec<Extent> = Vec::new();

    for o in outer {
        let o_end = o.physical + o.length;
        let mut cursor = o.physical;

        while cursor < o_end {
            let covering = inner
                .iter()
                .find(|i| i.logical <= cursor && cursor < i.logical + i.length);

            match covering {
                Some(i) => {
                    let take = (o_end - cursor).min(i.logical + i.length - cursor);
                    out.push(Extent {
                        logical: o.logical + (cursor - o.physical),
                        physical: i.physical + (cursor - i.logical),
                        length: take,
                    });
                    cursor += take;
                }
                None => {
                    // Inside an inner hole: skip to the next inner extent,
                    // or give up on this outer extent if none follows.
                    let next = inner
                        .iter()
                        .map(|i| i.logical)
                        .filter(|&l| l > cursor)
                        .min();
                    match next {
                        Some(l) => cursor = l.min(o_end),
                        None => break,
                    }
                }
            }
        }
    }

    out
}

/// An extent-mapped, read-only view over a parent reader.
///
/// Constructing an `ExtentReader` over a parent that is itself
/// extent-backed does not stack: the new map is composed against the
/// parent's map and the result points straight at the parent's base.
/// Chains of any depth therefore cost one extent lookup and one backing
/// read, never a recursive dispatch.
pub struct ExtentReader {
    base: SharedReader,
    extents: Vec<Extent>,
    size: u64,
}

impl ExtentReader {
    pub fn new(parent: SharedReader, mut extents: Vec<Extent>, size: u64) -> Self {
        extents.sort_by_key(|e| e.logical);

        if let Some((base, parent_extents)) = parent.extent_parts() {
            let extents = compose(&extents, &parent_extents);
            return Self { base, extents, size };
        }

        Self {
            base: parent,
            extents,
            size,
        }
    }

    /// The root reader all extents resolve against.
    pub fn base(&self) -> &SharedReader {
        &self.base
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    fn covering(&self, off: u64) -> Option<&Extent> {
        self.extents
            .iter()
            .find(|e| e.logical <= off && off < e.logical + e.length)
    }

    fn next_extent_start(&self, off: u64) -> u64 {
        self.extents
            .iter()
            .map(|e| e.logical)
            .filter(|&l| l > off)
            .min()
            .unwrap_or(self.size)
    }
}

impl BlockRead for ExtentReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn extent_parts(&self) -> Option<(SharedReader, Vec<Extent>)> {
        Some((self.base.clone(), self.extents.clone()))
    }

    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        if off >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - off) as usize);
        let mut done = 0;

        while done < want {
            let pos = off + done as u64;
            match self.covering(pos) {
                Some(e) => {
                    let within = pos - e.logical;
                    let take = (want - done).min((e.length - within) as usize);
                    let n = self
                        .base
                        .read_at(&mut buf[done..done + take], e.physical + within)?;
                    if n == 0 {
                        // Base ended inside a mapped extent; report the
                        // short read rather than spinning.
                        return Ok(done);
                    }
                    done += n;
                }
                None => {
                    // Hole: zero-fill up to the next extent or the end.
                    let gap_end = self.next_extent_start(pos).min(off + want as u64);
                    let zero = (gap_end - pos) as usize;
                    buf[done..done + zero].fill(0);
                    done += zero;
                }
            }
        }

        Ok(done)
    }
}

/// Write-side counterpart of [`ExtentReader`] for read-write exports.
///
/// Writes that land in a hole fail: a sparse region has no backing bytes
/// to receive them and this layer does not allocate.
pub struct ExtentWriter {
    base: SharedWriter,
    extents: Vec<Extent>,
    size: u64,
}

impl ExtentWriter {
    pub fn new(base: SharedWriter, mut extents: Vec<Extent>, size: u64) -> Self {
        extents.sort_by_key(|e| e.logical);
        Self {
            base,
            extents,
            size,
        }
    }
}

impl BlockWrite for ExtentWriter {
    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<usize> {
        if off + buf.len() as u64 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write past end of view at offset {off}"),
            ));
        }
        let mut done = 0;

        while done < buf.len() {
            let pos = off + done as u64;
            let e = self
                .extents
                .iter()
                .find(|e| e.logical <= pos && pos < e.logical + e.length)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("write into unmapped region at offset {pos}"),
                    )
                })?;

            let within = pos - e.logical;
            let take = (buf.len() - done).min((e.length - within) as usize);
            self.base
                .write_all_at(&buf[done..done + take], e.physical + within)?;
            done += take;
        }

        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBackend;

    fn ext(logical: u64, physical: u64, length: u64) -> Extent {
        Extent {
            logical,
            physical,
            length,
        }
    }

    #[test]
    fn test_compose_simple() {
        let outer = [ext(0, 1000, 100)];
        let inner = [ext(1000, 5000, 100)];
        assert_eq!(compose(&outer, &inner), vec![ext(0, 5000, 100)]);
    }

    #[test]
    fn test_compose_subset() {
        let outer = [ext(0, 1025, 50)];
        let inner = [ext(1000, 5000, 100)];
        assert_eq!(compose(&outer, &inner), vec![ext(0, 5025, 50)]);
    }

    #[test]
    fn test_compose_spans_two_inner() {
        let outer = [ext(0, 50, 100)];
        let inner = [ext(0, 1000, 100), ext(100, 2000, 100)];
        assert_eq!(
            compose(&outer, &inner),
            vec![ext(0, 1050, 50), ext(50, 2000, 50)]
        );
    }

    #[test]
    fn test_compose_multiple_outer() {
        let outer = [ext(0, 0, 50), ext(50, 100, 50)];
        let inner = [ext(0, 1000, 100), ext(100, 2000, 100)];
        assert_eq!(
            compose(&outer, &inner),
            vec![ext(0, 1000, 50), ext(50, 2000, 50)]
        );
    }

    #[test]
    fn test_compose_through_partition() {
        // A 4 KiB file at byte 40960 of a filesystem that itself starts
        // 1 MiB into the image.
        let outer = [ext(0, 40960, 4096)];
        let inner = [ext(0, 1048576, 1048576)];
        assert_eq!(compose(&outer, &inner), vec![ext(0, 1089536, 4096)]);
    }

    #[test]
    fn test_compose_inner_hole() {
        let outer = [ext(0, 50, 100)];
        let inner = [ext(0, 1000, 75), ext(100, 2000, 100)];
        // [50,75) maps through, [75,100) is an inner hole, [100,150) maps.
        assert_eq!(
            compose(&outer, &inner),
            vec![ext(0, 1050, 25), ext(50, 2000, 50)]
        );
    }

    #[test]
    fn test_compose_empty() {
        assert!(compose(&[], &[ext(0, 1000, 100)]).is_empty());
        assert!(compose(&[ext(0, 0, 100)], &[]).is_empty());
    }

    fn counting_base(len: usize) -> SharedReader {
        Arc::new(MemBackend::new((0..len).map(|i| (i % 256) as u8).collect()))
    }

    #[test]
    fn test_reader_zero_fills_holes() {
        let base = counting_base(1000);
        let extents = vec![ext(0, 100, 10), ext(20, 200, 10)];
        let r = ExtentReader::new(base, extents, 30);

        let mut buf = [0xFFu8; 30];
        assert_eq!(r.read_at(&mut buf, 0).unwrap(), 30);
        assert_eq!(&buf[0..10], &(100..110).map(|i| i as u8).collect::<Vec<_>>()[..]);
        assert_eq!(&buf[10..20], &[0u8; 10]);
        assert_eq!(&buf[20..30], &(200..210).map(|i| i as u8).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_reader_clamps_to_size() {
        let base = counting_base(1000);
        let r = ExtentReader::new(base, vec![ext(0, 0, 100)], 50);

        let mut buf = [0u8; 100];
        assert_eq!(r.read_at(&mut buf, 40).unwrap(), 10);
        assert_eq!(r.read_at(&mut buf, 50).unwrap(), 0);
        assert_eq!(r.read_at(&mut buf, 60).unwrap(), 0);
    }

    #[test]
    fn test_flattening_two_levels() {
        let base = counting_base(1000);
        let inner = Arc::new(ExtentReader::new(base.clone(), vec![ext(0, 100, 500)], 500));
        let outer = ExtentReader::new(inner, vec![ext(0, 50, 200)], 200);

        assert_eq!(outer.extents(), &[ext(0, 150, 200)]);

        let mut buf = [0u8; 10];
        outer.read_exact_at(&mut buf, 0).unwrap();
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, ((150 + i) % 256) as u8);
        }
    }

    #[test]
    fn test_flattening_deep_nesting() {
        let base = counting_base(10000);

        let l1 = Arc::new(ExtentReader::new(base, vec![ext(0, 1000, 5000)], 5000));
        let l2 = Arc::new(ExtentReader::new(l1, vec![ext(0, 500, 2000)], 2000));
        let l3 = Arc::new(ExtentReader::new(l2, vec![ext(0, 100, 1000)], 1000));
        let l4 = ExtentReader::new(l3, vec![ext(0, 50, 500)], 500);

        // Every level collapsed onto the root: one extent, direct offsets.
        assert_eq!(l4.extents(), &[ext(0, 1650, 500)]);

        let mut buf = [0u8; 10];
        l4.read_exact_at(&mut buf, 0).unwrap();
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, ((1650 + i) % 256) as u8, "byte {i}");
        }
    }

    #[test]
    fn test_writer_rejects_holes() {
        use std::io::Write;
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(&[0u8; 1000]).unwrap();
        let file = Arc::new(crate::block::FileBackend::open_rw(temp.path()).unwrap());

        let w = ExtentWriter::new(file.clone(), vec![ext(0, 100, 10), ext(20, 200, 10)], 30);

        w.write_all_at(&[7u8; 10], 0).unwrap();
        let mut buf = [0u8; 10];
        file.read_exact_at(&mut buf, 100).unwrap();
        assert_eq!(buf, [7u8; 10]);

        // Offset 10 is a hole in the view.
        assert!(w.write_at(&[1u8; 5], 10).is_err());
        // Past the view's size.
        assert!(w.write_at(&[1u8; 5], 28).is_err());
    }
}
