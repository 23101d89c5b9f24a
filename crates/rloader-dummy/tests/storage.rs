//! End-to-end tests: registry dispatch and the partition table living on
//! a storage device.

use rloader_core::dev::{DevClass, Registry, ERASE_ALL};
use rloader_core::ptable::{PartType, Partition, PartitionTable};
use rloader_core::Error;
use rloader_dummy::{RamConfig, RamStorage};

const SECTOR: usize = 0x1000;

fn config() -> RamConfig {
    RamConfig {
        size: 0x80_0000,
        sector_sz: SECTOR,
    }
}

#[test]
fn registry_dispatches_to_storage() {
    let mut dev = RamStorage::new(config());
    let mut registry = Registry::new();
    registry.register(DevClass::Storage, 1, &mut dev);

    registry.init(DevClass::Storage, 0).unwrap();

    let payload = b"loader payload";
    registry
        .write(DevClass::Storage, 0, 0x4000, payload)
        .unwrap();
    registry.sync(DevClass::Storage, 0).unwrap();

    let mut out = [0u8; 14];
    let got = registry
        .read(DevClass::Storage, 0, 0x4000, &mut out, 0)
        .unwrap();
    assert_eq!(got, payload.len());
    assert_eq!(&out, payload);
}

#[test]
fn registry_done_flushes_device() {
    let mut dev = RamStorage::new(config());
    let mut registry = Registry::new();
    registry.register(DevClass::Storage, 1, &mut dev);

    registry.init(DevClass::Storage, 0).unwrap();
    registry
        .write(DevClass::Storage, 0, 0x100, &[0x42; 8])
        .unwrap();
    registry.done(DevClass::Storage, 0).unwrap();

    drop(registry);
    assert_eq!(&dev.mem()[0x100..0x108], &[0x42; 8]);
}

#[test]
fn partition_table_lives_on_device() {
    let mut dev = RamStorage::new(config());
    let mut registry = Registry::new();
    registry.register(DevClass::Storage, 1, &mut dev);
    registry.init(DevClass::Storage, 0).unwrap();

    // Build and serialize a table into the last device block
    let mut table = PartitionTable::new();
    table
        .push(Partition::new("kernel", PartType::Raw, 0, 0x10_0000).unwrap())
        .unwrap();
    table
        .push(Partition::new("rootfs", PartType::Jffs2, 0x10_0000, 0x20_0000).unwrap())
        .unwrap();

    let memsz = 0x80_0000u64;
    let ptable_offs = memsz - SECTOR as u64;

    let mut block = vec![0xffu8; SECTOR];
    let size = table.serialize(&mut block, memsz, SECTOR as u32).unwrap();
    registry
        .write(DevClass::Storage, 0, ptable_offs, &block[..size])
        .unwrap();
    registry.sync(DevClass::Storage, 0).unwrap();

    // A fresh reader finds and verifies it
    let mut read_back = vec![0u8; SECTOR];
    registry
        .read(DevClass::Storage, 0, ptable_offs, &mut read_back, 0)
        .unwrap();

    let parsed = PartitionTable::parse(&read_back, memsz, SECTOR as u32).unwrap();
    assert_eq!(parsed.partitions(), table.partitions());

    let rootfs = parsed.find("rootfs").unwrap();
    assert_eq!(rootfs.offset, 0x10_0000);
    assert_eq!(rootfs.kind, PartType::Jffs2);

    // Corrupting the on-device table makes it unparseable
    let mut corrupt = read_back.clone();
    corrupt[20] ^= 0x01;
    assert_eq!(
        PartitionTable::parse(&corrupt, memsz, SECTOR as u32),
        Err(Error::Invalid)
    );
}

#[test]
fn whole_device_erase() {
    let mut dev = RamStorage::new(config());
    let mut registry = Registry::new();
    registry.register(DevClass::Storage, 1, &mut dev);
    registry.init(DevClass::Storage, 0).unwrap();

    registry
        .write(DevClass::Storage, 0, 0, &[0u8; 0x100])
        .unwrap();
    registry.sync(DevClass::Storage, 0).unwrap();

    let done = registry
        .erase(DevClass::Storage, 0, 0, ERASE_ALL, 0)
        .unwrap();
    assert_eq!(done, 0x80_0000);

    let mut out = [0u8; 0x100];
    registry.read(DevClass::Storage, 0, 0, &mut out, 0).unwrap();
    assert!(out.iter().all(|&b| b == 0xff));
}
