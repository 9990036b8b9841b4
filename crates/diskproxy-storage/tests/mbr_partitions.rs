use diskproxy_storage::{
    resolve_partition, Backing, ImageIo, MemBacking, PartitionExtent, ProxyError, SECTOR_SIZE,
};

const MIB: u64 = 1 << 20;

fn write_entry(sector: &mut [u8], slot: usize, status: u8, ptype: u8, rel_sectors: u32, num_sectors: u32) {
    let base = 0x1BE + slot * 16;
    sector[base] = status;
    sector[base + 4] = ptype;
    sector[base + 8..base + 12].copy_from_slice(&rel_sectors.to_le_bytes());
    sector[base + 12..base + 16].copy_from_slice(&num_sectors.to_le_bytes());
}

fn sign(sector: &mut [u8]) {
    sector[0x1FE] = 0x55;
    sector[0x1FF] = 0xAA;
}

fn sectors(bytes: u64) -> u32 {
    (bytes / SECTOR_SIZE as u64) as u32
}

/// Two primary partitions: 100 MiB at 1 MiB, 200 MiB at 101 MiB.
fn two_primaries() -> MemBacking {
    let mut mbr = [0u8; SECTOR_SIZE];
    write_entry(&mut mbr, 0, 0x80, 0x83, sectors(MIB), sectors(100 * MIB));
    write_entry(&mut mbr, 1, 0x00, 0x07, sectors(101 * MIB), sectors(200 * MIB));
    sign(&mut mbr);

    // Only the boot sector matters to the walk; extents are validated
    // against the current_size the caller passes in.
    let mut backing = MemBacking::with_len(SECTOR_SIZE);
    backing.write_all_at(&mbr, 0).unwrap();
    backing
}

#[test]
fn primary_partitions_resolve_in_table_order() {
    let mut image = ImageIo::Raw(two_primaries());

    let first = resolve_partition(&mut image, 302 * MIB, 1).unwrap().unwrap();
    assert_eq!(
        first,
        PartitionExtent {
            offset: MIB,
            len: 100 * MIB
        }
    );

    let second = resolve_partition(&mut image, 302 * MIB, 2).unwrap().unwrap();
    assert_eq!(
        second,
        PartitionExtent {
            offset: 101 * MIB,
            len: 200 * MIB
        }
    );
}

#[test]
fn missing_index_reports_not_found() {
    let mut image = ImageIo::Raw(two_primaries());
    let err = resolve_partition(&mut image, 302 * MIB, 3).unwrap_err();
    assert!(matches!(err, ProxyError::PartitionNotFound { index: 3 }));
}

#[test]
fn partition_past_image_end_reports_not_found() {
    // current_size smaller than the second partition's end.
    let mut image = ImageIo::Raw(two_primaries());
    let err = resolve_partition(&mut image, 150 * MIB, 2).unwrap_err();
    assert!(matches!(err, ProxyError::PartitionNotFound { index: 2 }));
}

#[test]
fn no_signature_means_no_mbr() {
    let mut backing = MemBacking::with_len((4 * MIB) as usize);
    let mut mbr = [0u8; SECTOR_SIZE];
    write_entry(&mut mbr, 0, 0x00, 0x83, 2048, 2048);
    backing.write_all_at(&mbr, 0).unwrap();

    let mut image = ImageIo::Raw(backing);
    assert!(resolve_partition(&mut image, 4 * MIB, 1).unwrap().is_none());
}

#[test]
fn stray_status_bit_invalidates_the_mbr() {
    let mut mbr = [0u8; SECTOR_SIZE];
    write_entry(&mut mbr, 0, 0x01, 0x83, sectors(MIB), sectors(MIB));
    sign(&mut mbr);

    let mut backing = MemBacking::with_len((4 * MIB) as usize);
    backing.write_all_at(&mbr, 0).unwrap();

    let mut image = ImageIo::Raw(backing);
    assert!(resolve_partition(&mut image, 4 * MIB, 1).unwrap().is_none());
}

#[test]
fn empty_entries_are_skipped_when_counting() {
    let mut mbr = [0u8; SECTOR_SIZE];
    // Slot 0 empty; the only partition sits in slot 2 and is index 1.
    write_entry(&mut mbr, 2, 0x00, 0x83, sectors(2 * MIB), sectors(MIB));
    sign(&mut mbr);

    let mut backing = MemBacking::with_len((4 * MIB) as usize);
    backing.write_all_at(&mbr, 0).unwrap();

    let mut image = ImageIo::Raw(backing);
    let extent = resolve_partition(&mut image, 4 * MIB, 1).unwrap().unwrap();
    assert_eq!(
        extent,
        PartitionExtent {
            offset: 2 * MIB,
            len: MIB
        }
    );
}

/// One primary plus an extended container holding two logical partitions.
///
/// Layout (sector units):
///   primary:   2048..4096
///   container: starts at 4096
///     EBR#1 at 4096: logical at +16 (1 MiB long), link to EBR#2 at +4096
///     EBR#2 at 8192: logical at +16 (2 MiB long), no further link
fn extended_chain() -> MemBacking {
    let mut backing = MemBacking::with_len((64 * MIB) as usize);

    let mut mbr = [0u8; SECTOR_SIZE];
    write_entry(&mut mbr, 0, 0x80, 0x83, 2048, 2048);
    write_entry(&mut mbr, 1, 0x00, 0x05, 4096, 8192);
    sign(&mut mbr);
    backing.write_all_at(&mbr, 0).unwrap();

    let mut ebr1 = [0u8; SECTOR_SIZE];
    write_entry(&mut ebr1, 0, 0x00, 0x83, 16, sectors(MIB));
    write_entry(&mut ebr1, 1, 0x00, 0x05, 4096, 4096);
    sign(&mut ebr1);
    backing.write_all_at(&ebr1, 4096 * SECTOR_SIZE as u64).unwrap();

    let mut ebr2 = [0u8; SECTOR_SIZE];
    write_entry(&mut ebr2, 0, 0x00, 0x83, 16, sectors(2 * MIB));
    sign(&mut ebr2);
    backing.write_all_at(&ebr2, 8192 * SECTOR_SIZE as u64).unwrap();

    backing
}

#[test]
fn logical_partitions_continue_the_numbering() {
    let mut image = ImageIo::Raw(extended_chain());

    let first = resolve_partition(&mut image, 64 * MIB, 1).unwrap().unwrap();
    assert_eq!(
        first,
        PartitionExtent {
            offset: 2048 * SECTOR_SIZE as u64,
            len: 2048 * SECTOR_SIZE as u64
        }
    );

    // Index 2: first logical, relative to EBR#1 at sector 4096.
    let second = resolve_partition(&mut image, 64 * MIB, 2).unwrap().unwrap();
    assert_eq!(
        second,
        PartitionExtent {
            offset: (4096 + 16) * SECTOR_SIZE as u64,
            len: MIB
        }
    );

    // Index 3: second logical, relative to EBR#2 at sector 8192 (the link is
    // relative to the first EBR).
    let third = resolve_partition(&mut image, 64 * MIB, 3).unwrap().unwrap();
    assert_eq!(
        third,
        PartitionExtent {
            offset: (8192 + 16) * SECTOR_SIZE as u64,
            len: 2 * MIB
        }
    );
}

#[test]
fn broken_ebr_terminates_the_chain() {
    let mut backing = extended_chain();
    // Wipe EBR#2's signature: index 3 becomes unreachable.
    backing
        .write_all_at(&[0u8, 0u8], 8192 * SECTOR_SIZE as u64 + 0x1FE)
        .unwrap();

    let mut image = ImageIo::Raw(backing);
    assert!(resolve_partition(&mut image, 64 * MIB, 2).unwrap().is_some());
    let err = resolve_partition(&mut image, 64 * MIB, 3).unwrap_err();
    assert!(matches!(err, ProxyError::PartitionNotFound { index: 3 }));
}

#[test]
fn zero_length_partition_reports_not_found() {
    let mut mbr = [0u8; SECTOR_SIZE];
    write_entry(&mut mbr, 0, 0x00, 0x83, 2048, 0);
    sign(&mut mbr);

    let mut backing = MemBacking::with_len((4 * MIB) as usize);
    backing.write_all_at(&mbr, 0).unwrap();

    let mut image = ImageIo::Raw(backing);
    let err = resolve_partition(&mut image, 4 * MIB, 1).unwrap_err();
    assert!(matches!(err, ProxyError::PartitionNotFound { index: 1 }));
}
