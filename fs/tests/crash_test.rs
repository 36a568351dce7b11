//! Crash-recovery: for every prefix of the device-write stream, a
//! remount (which replays the log) must land exactly on one of the
//! states left by a committed transaction, never between two.

mod common;

use std::sync::{Arc, Mutex};

use common::{IMAGE_BLOCKS, Image};
use orefs::{
    FileSystem, OpenFlags,
    device::{BlockDevice, MemDevice},
    mkfs::{self, Geometry},
    ops,
    types::BLOCK_SIZE,
};

/// Passes everything through to a [`MemDevice`] while journaling every
/// block write, so a test can replay arbitrary prefixes of the stream.
#[derive(Clone)]
struct RecordingDevice {
    inner: MemDevice,
    journal: Arc<Mutex<Vec<(usize, Box<[u8; BLOCK_SIZE]>)>>>,
}

impl RecordingDevice {
    fn new(inner: MemDevice) -> Self {
        Self {
            inner,
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn clear(&self) {
        self.journal.lock().unwrap().clear();
    }

    fn writes(&self) -> Vec<(usize, Box<[u8; BLOCK_SIZE]>)> {
        self.journal.lock().unwrap().clone()
    }
}

impl BlockDevice for RecordingDevice {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn read_block(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]) {
        self.inner.read_block(index, buf);
    }

    fn write_block(&self, index: usize, buf: &[u8; BLOCK_SIZE]) {
        self.journal.lock().unwrap().push((index, Box::new(*buf)));
        self.inner.write_block(index, buf);
    }
}

/// The image with the log region blanked: recovery may leave stale log
/// bodies behind, which are not part of the logical state.
fn logical_state(dev: &MemDevice) -> Vec<u8> {
    let image = Image::load(dev);
    let logstart = image.sb.logstart as usize;
    let nlog = image.sb.nlog as usize;
    let mut state = dev.to_image();
    state[logstart * BLOCK_SIZE..(logstart + nlog) * BLOCK_SIZE].fill(0);
    state
}

/// Runs `steps` (each one or more whole transactions) against a fresh
/// file system, then crashes at every point in the device-write stream
/// and checks that recovery lands on a step boundary.
fn check_crash_atomicity(steps: &[&dyn Fn(&FileSystem)]) {
    let base = MemDevice::new(IMAGE_BLOCKS);
    mkfs::format(&base, &Geometry::default()).unwrap();
    let recorder = RecordingDevice::new(base.clone());

    let fs = FileSystem::mount(Box::new(recorder.clone())).unwrap();
    let pre_image = base.to_image();
    recorder.clear();

    let mut checkpoints = vec![logical_state(&base)];
    for step in steps {
        step(&fs);
        checkpoints.push(logical_state(&base));
    }
    let writes = recorder.writes();
    drop(fs);

    assert_ne!(
        checkpoints.first(),
        checkpoints.last(),
        "steps had no observable effect"
    );

    for cut in 0..=writes.len() {
        // Crash after `cut` writes, then remount: recovery replays any
        // committed-but-uninstalled transaction.
        let dev = MemDevice::from_image(&pre_image, IMAGE_BLOCKS);
        for (index, data) in &writes[..cut] {
            dev.write_block(*index, data);
        }
        drop(FileSystem::mount(Box::new(dev.clone())).unwrap());

        let recovered = logical_state(&dev);
        assert!(
            checkpoints.contains(&recovered),
            "crash after {cut}/{} writes recovered to a state between transactions",
            writes.len()
        );
        Image::load(&dev).check_invariants();
    }
}

#[test]
fn mkdir_commits_atomically() {
    check_crash_atomicity(&[&|fs| {
        ops::mkdir(fs, None, b"/d").unwrap();
    }]);
}

#[test]
fn create_then_write_commit_atomically() {
    check_crash_atomicity(&[
        &|fs| {
            drop(ops::open(fs, None, b"/f", OpenFlags::CREATE | OpenFlags::RDWR).unwrap());
        },
        &|fs| {
            let file = ops::open(fs, None, b"/f", OpenFlags::RDWR).unwrap();
            // One transaction: content blocks, block map, bitmap, inode.
            ops::write_file(fs, &file, 0, &[0x5c; 2 * BLOCK_SIZE]).unwrap();
        },
    ]);
}

#[test]
fn unlink_commits_atomically() {
    check_crash_atomicity(&[
        &|fs| {
            let file = ops::open(fs, None, b"/victim", OpenFlags::CREATE | OpenFlags::RDWR).unwrap();
            ops::write_file(fs, &file, 0, b"doomed").unwrap();
        },
        &|fs| {
            ops::unlink(fs, None, b"/victim").unwrap();
        },
    ]);
}

/// A committed-but-uninstalled transaction (head block written, home
/// blocks not yet) must be replayed in full by recovery, data included.
#[test]
fn recovery_replays_committed_content() {
    let base = MemDevice::new(IMAGE_BLOCKS);
    mkfs::format(&base, &Geometry::default()).unwrap();
    let recorder = RecordingDevice::new(base.clone());

    let fs = FileSystem::mount(Box::new(recorder.clone())).unwrap();
    let pre_image = base.to_image();
    recorder.clear();
    let file = ops::open(&fs, None, b"/f", OpenFlags::CREATE | OpenFlags::RDWR).unwrap();
    ops::write_file(&fs, &file, 0, b"survives").unwrap();
    drop(file);
    let writes = recorder.writes();
    drop(fs);

    // Find the head-block write that commits the second transaction (the
    // content write) and crash right after it: committed, not installed.
    let head = Image::load(&base).sb.logstart as usize;
    let head_commits: Vec<usize> = writes
        .iter()
        .enumerate()
        .filter(|(_, (index, data))| *index == head && data.iter().any(|&b| b != 0))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(head_commits.len(), 2, "expected two committed transactions");

    let cut = head_commits[1] + 1;
    let dev = MemDevice::from_image(&pre_image, IMAGE_BLOCKS);
    for (index, data) in &writes[..cut] {
        dev.write_block(*index, data);
    }
    let fs = FileSystem::mount(Box::new(dev.clone())).unwrap();
    let found = ops::open(&fs, None, b"/f", OpenFlags::empty()).unwrap();
    let mut buf = [0_u8; 8];
    ops::read_file(&fs, &found, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"survives");
}
