//! Path resolution.
//!
//! Paths are byte strings of `/`-separated components. Resolution walks
//! one component at a time, holding at most one inode lock; each level is
//! unlocked and released before descending into the next, which keeps
//! concurrent walkers from deadlocking against each other.

use orefs_types::{InodeNo, NAME_LEN};

use crate::{
    error::Error,
    inode::{Inode, TxInode},
    wal::Tx,
};

/// Splits the next path component off `path`.
///
/// Leading slashes are skipped; the remainder comes back with its own
/// leading slashes removed. `None` when no component is left.
///
/// ```text
/// skip_elem(b"a/bb/c")  == Some((b"a", b"bb/c"))
/// skip_elem(b"///a//bb") == Some((b"a", b"bb"))
/// skip_elem(b"a")       == Some((b"a", b""))
/// skip_elem(b"a/")      == Some((b"a", b""))
/// skip_elem(b"")        == None
/// skip_elem(b"///")     == None
/// ```
fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];
    let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let elem = &path[..end];
    let rest = &path[end..];
    let next = rest.iter().position(|&c| c != b'/').unwrap_or(rest.len());
    Some((elem, &rest[next..]))
}

/// Looks up the inode for `path`.
///
/// Absolute paths start at the root; relative paths start at `cwd` (or
/// the root when no working directory is given).
pub fn resolve<'tx, const READ_ONLY: bool>(
    tx: &'tx Tx<'tx, READ_ONLY>,
    cwd: Option<&Inode<'_>>,
    path: &[u8],
) -> Result<TxInode<'tx, READ_ONLY>, Error> {
    resolve_impl(tx, cwd, path, false, None)
}

/// Looks up the parent directory of `path`, also reporting the final
/// component (truncated to [`NAME_LEN`] bytes) through `name`.
///
/// Fails on a path with no final component, such as `"/"`.
pub fn resolve_parent<'tx, 'n, const READ_ONLY: bool>(
    tx: &'tx Tx<'tx, READ_ONLY>,
    cwd: Option<&Inode<'_>>,
    path: &[u8],
    name: &'n mut [u8; NAME_LEN],
) -> Result<(TxInode<'tx, READ_ONLY>, &'n [u8]), Error> {
    let ip = resolve_impl(tx, cwd, path, true, Some(name))?;
    let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    Ok((ip, &name[..len]))
}

fn resolve_impl<'tx, const READ_ONLY: bool>(
    tx: &'tx Tx<'tx, READ_ONLY>,
    cwd: Option<&Inode<'_>>,
    path: &[u8],
    parent: bool,
    mut name_out: Option<&mut [u8; NAME_LEN]>,
) -> Result<TxInode<'tx, READ_ONLY>, Error> {
    let mut ip = match cwd {
        Some(cwd) if path.first() != Some(&b'/') => cwd.into_tx(tx),
        _ => TxInode::get(tx, InodeNo::ROOT),
    };

    let mut path = path;
    while let Some((name, rest)) = skip_elem(path) {
        path = rest;
        if let Some(out) = &mut name_out {
            let len = usize::min(name.len(), out.len());
            out[..len].copy_from_slice(&name[..len]);
            out[len..].fill(0);
        }

        let mut lip = ip.lock();
        if !lip.is_dir() {
            return Err(Error::NotADirectory);
        }

        if parent && path.is_empty() {
            // Stop one level early; the caller wants the directory.
            drop(lip);
            return Ok(ip);
        }

        let Some((next, _off)) = lip.as_dir().unwrap().lookup(name) else {
            return Err(Error::NotFound);
        };
        drop(lip);
        ip = next;
    }

    if parent {
        // The path named no final component.
        return Err(Error::NotFound);
    }
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::skip_elem;

    #[test]
    fn skip_elem_splits_components() {
        assert_eq!(skip_elem(b"a/bb/c"), Some((&b"a"[..], &b"bb/c"[..])));
        assert_eq!(skip_elem(b"///a//bb"), Some((&b"a"[..], &b"bb"[..])));
        assert_eq!(skip_elem(b"a"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b"a/"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b""), None);
        assert_eq!(skip_elem(b"///"), None);
    }
}
