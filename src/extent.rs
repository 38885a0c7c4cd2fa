//! Index-partition extent bookkeeping (spec.md §4.5 "Servicing IP").
//!
//! Every time the writer lands a block on IP it reports a freshly-written
//! span back here to be merged into the dentry's sorted, non-overlapping
//! `IpExtent` list. A new extent may fully or partially shadow extents
//! already on file (an earlier IP write since superseded by a newer one);
//! the merge keeps the list minimal, coalescing two separately-written
//! extents into one whenever they turn out physically contiguous.

use crate::request::IpExtent;

/// Physical (block, byte-offset) position one past the last byte `extent`
/// covers on the index partition.
fn physical_end(extent: &IpExtent, block_size: usize) -> (u64, u32) {
    let total = extent.byte_offset as u64 + extent.byte_count;
    let blocks = total / block_size as u64;
    let rem = (total % block_size as u64) as u32;
    (extent.start_block + blocks, rem)
}

/// Physical position `skip` bytes past `(start_block, byte_offset)`.
fn advance_physical(start_block: u64, byte_offset: u32, skip: u64, block_size: usize) -> (u64, u32) {
    let total = byte_offset as u64 + skip;
    let blocks = total / block_size as u64;
    let rem = (total % block_size as u64) as u32;
    (start_block + blocks, rem)
}

/// `true` if `a` ends exactly where `b` begins, both logically (file
/// offset) and physically (index-partition block/byte position) -- the
/// condition under which two extents can be merged into one instead of
/// kept as separate entries.
fn physically_contiguous(a: &IpExtent, b: &IpExtent, block_size: usize) -> bool {
    a.end_offset() == b.file_offset && physical_end(a, block_size) == (b.start_block, b.byte_offset)
}

/// Insert a newly-written extent into `extents`, applying spec.md §4.5's
/// merge rules against every existing extent it touches, in file-offset
/// order:
///
/// - an extent that ends before `new` is left alone, unless it ends
///   exactly where `new` begins and the two are physically contiguous, in
///   which case it is extended in place to cover `new` as well;
/// - an extent fully covered by `new` is deleted;
/// - an extent that starts before `new` and overlaps it is truncated from
///   the end;
/// - an extent that starts within `new`'s range (without being fully
///   covered) is truncated from the front, its physical start advanced
///   past the overwritten prefix;
/// - otherwise `new` is inserted in its sorted position.
///
/// After an in-place merge, also absorbs the following extent if it too
/// turns out physically contiguous with the merged result.
pub fn insert_ip_extent(extents: &mut Vec<IpExtent>, new: IpExtent, block_size: usize) {
    let mut i = 0;
    let mut merged_at = None;

    while i < extents.len() {
        let e = extents[i];

        if e.end_offset() <= new.file_offset {
            if e.end_offset() == new.file_offset && physically_contiguous(&e, &new, block_size) {
                extents[i].byte_count += new.byte_count;
                merged_at = Some(i);
                break;
            }
            i += 1;
            continue;
        }

        if e.file_offset >= new.file_offset && e.end_offset() <= new.end_offset() {
            extents.remove(i);
            continue;
        }

        if e.file_offset < new.file_offset && e.end_offset() > new.file_offset {
            extents[i].byte_count = new.file_offset - e.file_offset;
            i += 1;
            continue;
        }

        if e.file_offset >= new.file_offset && e.file_offset < new.end_offset() {
            let dropped = new.end_offset() - e.file_offset;
            let (start_block, byte_offset) =
                advance_physical(e.start_block, e.byte_offset, dropped, block_size);
            extents[i] = IpExtent {
                file_offset: new.end_offset(),
                byte_count: e.byte_count - dropped,
                start_block,
                byte_offset,
            };
            i += 1;
            continue;
        }

        i += 1;
    }

    match merged_at {
        Some(i) => {
            // The extend-in-place above may now abut the next extent too.
            while i + 1 < extents.len() && physically_contiguous(&extents[i], &extents[i + 1], block_size) {
                let next = extents.remove(i + 1);
                extents[i].byte_count += next.byte_count;
            }
        }
        None => {
            let pos = extents.partition_point(|e| e.file_offset < new.file_offset);
            extents.insert(pos, new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(file_offset: u64, byte_count: u64, start_block: u64) -> IpExtent {
        IpExtent {
            file_offset,
            byte_count,
            start_block,
            byte_offset: 0,
        }
    }

    #[test]
    fn disjoint_extent_is_inserted_sorted() {
        let mut extents = vec![extent(0, 10, 0)];
        insert_ip_extent(&mut extents, extent(100, 10, 20), 10);
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[1].file_offset, 100);
    }

    #[test]
    fn adjacent_and_physically_contiguous_extents_merge() {
        // Two 64 KiB DP blocks at file offsets 0 and 65536, written to
        // adjacent IP tape blocks, coalesce into one extent (scenario 6).
        let mut extents = vec![extent(0, 65536, 0)];
        insert_ip_extent(&mut extents, extent(65536, 65536, 1), 65536);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].file_offset, 0);
        assert_eq!(extents[0].byte_count, 131072);
    }

    #[test]
    fn adjacent_but_not_physically_contiguous_extents_stay_separate() {
        let mut extents = vec![extent(0, 65536, 0)];
        insert_ip_extent(&mut extents, extent(65536, 65536, 5), 65536);
        assert_eq!(extents.len(), 2);
    }

    #[test]
    fn new_extent_fully_covering_old_one_deletes_it() {
        let mut extents = vec![extent(10, 10, 1)];
        insert_ip_extent(&mut extents, extent(0, 40, 0), 40);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].file_offset, 0);
        assert_eq!(extents[0].byte_count, 40);
    }

    #[test]
    fn new_extent_overlapping_from_the_front_truncates_old_from_the_end() {
        let mut extents = vec![extent(0, 20, 0)];
        insert_ip_extent(&mut extents, extent(10, 20, 5), 20);
        assert_eq!(extents[0].file_offset, 0);
        assert_eq!(extents[0].byte_count, 10);
    }

    #[test]
    fn new_extent_overlapping_from_the_back_truncates_old_from_the_front() {
        let mut extents = vec![extent(10, 20, 0)];
        insert_ip_extent(&mut extents, extent(0, 15, 5), 8);
        let surviving = extents.iter().find(|e| e.file_offset >= 15).unwrap();
        assert_eq!(surviving.file_offset, 15);
        assert_eq!(surviving.byte_count, 15);
    }
}
