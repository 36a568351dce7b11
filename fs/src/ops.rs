//! High-level operations.
//!
//! Each function here is one syscall-sized unit of work: it opens a log
//! transaction, does its inode and block work, and lets the transaction
//! commit on scope exit. A failure inside unwinds whatever it built
//! (link counts, references) before the transaction closes, so a partial
//! operation is never committed.

use bitflags::bitflags;
use orefs_types::{BLOCK_SIZE, MAX_SYMLINK, NAME_LEN};

use crate::{
    FileSystem,
    error::Error,
    inode::{Inode, TxInode},
    params::{MAX_OP_BLOCKS, MAX_PATH, MAX_SYMLINK_DEPTH},
    path,
    stat::{InodeType, Stat},
    wal::Tx,
};

bitflags! {
    /// `open` flags. The default (empty) value is read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
        const TRUNC = 0x400;
        const NOFOLLOW = 0x800;
    }
}

impl OpenFlags {
    fn writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// Bytes one transaction-sized write chunk may carry: a conservative
/// budget of `MAX_OP_BLOCKS` minus the inode block, a bitmap block, and
/// two indirect blocks, halved because a chunk can straddle block
/// boundaries.
const WRITE_CHUNK: usize = ((MAX_OP_BLOCKS - 1 - 1 - 2) / 2) * BLOCK_SIZE;

fn check_path(path: &[u8]) -> Result<(), Error> {
    if path.len() > MAX_PATH {
        return Err(Error::PathTooLong);
    }
    Ok(())
}

/// Creates an inode of type `ty` at `path` and links it into the parent
/// directory. For a regular-file create that loses a race (or repeats),
/// an existing file or device at `path` is returned instead.
///
/// Directory creation wires up `.` and `..`: the parent's link count
/// grows for the child's `..`, while the child's own `.` deliberately
/// does not count toward the child; a self-link would keep every empty
/// directory alive forever.
pub(crate) fn create<'tx>(
    tx: &'tx Tx<'tx, false>,
    cwd: Option<&Inode<'_>>,
    path: &[u8],
    ty: InodeType,
    major: i16,
    minor: i16,
) -> Result<TxInode<'tx, false>, Error> {
    let mut name = [0; NAME_LEN];
    let (mut parent, name) = path::resolve_parent(tx, cwd, path, &mut name)?;
    let parent_ino = parent.ino();

    let mut plip = parent.lock();
    if !plip.is_dir() {
        return Err(Error::NotADirectory);
    }

    let found = plip.as_dir().unwrap().lookup(name);
    if let Some((mut existing, _off)) = found {
        let elip = existing.lock();
        let ety = elip.ty();
        drop(elip);
        drop(plip);
        if ty == InodeType::File && matches!(ety, InodeType::File | InodeType::Device) {
            return Ok(existing);
        }
        return Err(Error::AlreadyExists);
    }

    let mut child = TxInode::alloc(tx, ty);
    let child_ino = child.ino();
    let mut clip = child.lock();
    clip.data_mut().major = major;
    clip.data_mut().minor = minor;
    clip.data_mut().nlink = 1;
    clip.update();

    // The parent stays locked from the lookup above through the link
    // below, so a racing create of the same name serializes here and the
    // loser sees the entry. Directory writes past this point cannot fail:
    // the name was just verified absent and block allocation panics
    // rather than erring.
    if ty == InodeType::Dir {
        let mut cdir = clip.as_dir().unwrap();
        cdir.link(b".", child_ino).expect("directory write failed");
        cdir.link(b"..", parent_ino).expect("directory write failed");
    }

    plip.as_dir()
        .unwrap()
        .link(name, child_ino)
        .expect("directory write failed");

    if ty == InodeType::Dir {
        // Now that success is guaranteed: the child's ".." references the
        // parent.
        plip.data_mut().nlink += 1;
        plip.update();
    }

    drop(clip);
    drop(plip);
    Ok(child)
}

/// Opens `path`, following symbolic links unless
/// [`OpenFlags::NOFOLLOW`] is given, and returns a long-term reference.
pub fn open<'fs>(
    fs: &'fs FileSystem,
    cwd: Option<&Inode<'_>>,
    path: &[u8],
    flags: OpenFlags,
) -> Result<Inode<'fs>, Error> {
    check_path(path)?;
    let tx = fs.begin_tx();

    let mut ip = if flags.contains(OpenFlags::CREATE) {
        create(&tx, cwd, path, InodeType::File, 0, 0)?
    } else {
        path::resolve(&tx, cwd, path)?
    };

    if !flags.contains(OpenFlags::NOFOLLOW) {
        let mut depth = 0;
        loop {
            let lip = ip.lock();
            if lip.ty() != InodeType::Symlink {
                break;
            }
            depth += 1;
            if depth > MAX_SYMLINK_DEPTH {
                return Err(Error::TooManyLinks);
            }
            let mut target = [0; MAX_SYMLINK];
            let len = lip.link_target().len();
            target[..len].copy_from_slice(lip.link_target());
            drop(lip);
            // Every reference and lock taken so far is released before
            // the next hop; a failed hop leaves nothing behind.
            ip = path::resolve(&tx, cwd, &target[..len])?;
        }
    }

    let mut lip = ip.lock();
    if lip.is_dir() && flags.writable() {
        return Err(Error::IsADirectory);
    }
    if flags.contains(OpenFlags::TRUNC) && flags.writable() && lip.ty() == InodeType::File {
        lip.truncate();
    }
    drop(lip);

    Ok(Inode::adopt(fs, &ip))
}

/// Creates a directory at `path`.
pub fn mkdir(fs: &FileSystem, cwd: Option<&Inode<'_>>, path: &[u8]) -> Result<(), Error> {
    check_path(path)?;
    let tx = fs.begin_tx();
    create(&tx, cwd, path, InodeType::Dir, 0, 0)?;
    Ok(())
}

/// Creates a device node at `path`.
pub fn mknod(
    fs: &FileSystem,
    cwd: Option<&Inode<'_>>,
    path: &[u8],
    major: i16,
    minor: i16,
) -> Result<(), Error> {
    check_path(path)?;
    let tx = fs.begin_tx();
    create(&tx, cwd, path, InodeType::Device, major, minor)?;
    Ok(())
}

/// Creates a symbolic link at `path` pointing to `target`. The target is
/// stored inside the inode record, truncated to [`MAX_SYMLINK`] bytes.
pub fn symlink(
    fs: &FileSystem,
    cwd: Option<&Inode<'_>>,
    target: &[u8],
    path: &[u8],
) -> Result<(), Error> {
    check_path(path)?;
    let tx = fs.begin_tx();
    let mut ip = create(&tx, cwd, path, InodeType::Symlink, 0, 0)?;
    let mut lip = ip.lock();
    lip.set_link_target(target);
    lip.update();
    Ok(())
}

/// Adds a hard link at `new` to the inode named by `old`. Directories
/// cannot be linked: a second parent would corrupt the `..` bookkeeping.
pub fn link(
    fs: &FileSystem,
    cwd: Option<&Inode<'_>>,
    old: &[u8],
    new: &[u8],
) -> Result<(), Error> {
    check_path(old)?;
    check_path(new)?;
    let tx = fs.begin_tx();

    let mut ip = path::resolve(&tx, cwd, old)?;
    {
        let mut lip = ip.lock();
        if lip.is_dir() {
            return Err(Error::IsADirectory);
        }
        lip.data_mut().nlink += 1;
        lip.update();
    }
    let ino = ip.ino();

    let linked = (|| {
        let mut name = [0; NAME_LEN];
        let (mut parent, name) = path::resolve_parent(&tx, cwd, new, &mut name)?;
        let mut plip = parent.lock();
        let mut pdir = plip.as_dir().ok_or(Error::NotADirectory)?;
        pdir.link(name, ino)
    })();

    if let Err(err) = linked {
        // Roll the link count back before the transaction closes.
        let mut lip = ip.lock();
        lip.data_mut().nlink -= 1;
        lip.update();
        return Err(err);
    }
    Ok(())
}

/// Removes the directory entry named by `path`. The inode itself is
/// freed once its link count and the last in-memory reference are gone.
pub fn unlink(fs: &FileSystem, cwd: Option<&Inode<'_>>, path: &[u8]) -> Result<(), Error> {
    check_path(path)?;
    let tx = fs.begin_tx();

    let mut name = [0; NAME_LEN];
    let (mut parent, name) = path::resolve_parent(&tx, cwd, path, &mut name)?;
    if name == b"." || name == b".." {
        return Err(Error::NotPermitted);
    }

    let mut plip = parent.lock();
    let (mut child, off) = plip
        .as_dir()
        .ok_or(Error::NotADirectory)?
        .lookup(name)
        .ok_or(Error::NotFound)?;

    let mut clip = child.lock();
    assert!(clip.nlink() > 0, "unlinking an unlinked inode");
    if let Some(cdir) = clip.as_dir() {
        if !cdir.is_empty() {
            return Err(Error::DirectoryNotEmpty);
        }
    }

    plip.as_dir().unwrap().clear_entry(off);
    if clip.is_dir() {
        // The child's ".." no longer references the parent.
        plip.data_mut().nlink -= 1;
        plip.update();
    }
    drop(plip);

    clip.data_mut().nlink -= 1;
    clip.update();
    drop(clip);

    // `child` drops here, still inside the transaction: if that was the
    // last reference and the last link, the inode is freed now.
    Ok(())
}

/// Resolves `path` to a directory and returns a long-term reference for
/// use as a working directory.
pub fn chdir<'fs>(
    fs: &'fs FileSystem,
    cwd: Option<&Inode<'_>>,
    path: &[u8],
) -> Result<Inode<'fs>, Error> {
    check_path(path)?;
    let tx = fs.begin_tx();
    let mut ip = path::resolve(&tx, cwd, path)?;
    let lip = ip.lock();
    if !lip.is_dir() {
        return Err(Error::NotADirectory);
    }
    drop(lip);
    Ok(Inode::adopt(fs, &ip))
}

/// Reads up to `buf.len()` bytes at `off` from an open inode.
pub fn read_file(fs: &FileSystem, ip: &Inode<'_>, off: usize, buf: &mut [u8]) -> Result<usize, Error> {
    let tx = fs.read_tx();
    let mut tip = ip.into_tx(&tx);
    let lip = tip.lock();
    lip.read(off, buf)
}

/// Writes `data` at `off` to an open inode, splitting the work into
/// transaction-sized chunks so a large write can never overflow the log.
pub fn write_file(fs: &FileSystem, ip: &Inode<'_>, off: usize, data: &[u8]) -> Result<usize, Error> {
    let mut done = 0;
    while done < data.len() {
        let n = usize::min(data.len() - done, WRITE_CHUNK);
        let tx = fs.begin_tx();
        let mut tip = ip.into_tx(&tx);
        let mut lip = tip.lock();
        let written = lip.write(off + done, &data[done..done + n])?;
        drop(lip);
        drop(tip);
        drop(tx);
        done += written;
    }
    Ok(done)
}

/// Stats an open inode.
pub fn stat_file(fs: &FileSystem, ip: &Inode<'_>) -> Stat {
    let tx = fs.read_tx();
    let mut tip = ip.into_tx(&tx);
    let lip = tip.lock();
    lip.stat()
}
