use std::path::{Path, PathBuf};

/// Round `val` up to the next multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// Picks a path that does not yet exist by appending a hexadecimal counter
/// to `base` until the name is free.
///
/// Files written into a binary directory (dumped metadata, bitstream
/// images, exported buffers) must not clobber each other when a name is
/// reused across loads.
#[must_use]
pub fn unique_path(base: &Path) -> PathBuf {
    if !base.exists() {
        return base.to_path_buf();
    }
    let mut counter: u32 = 0;
    loop {
        let mut name = base.as_os_str().to_os_string();
        name.push(format!("{counter:x}"));
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn unique_path_skips_existing_names() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dump");

        assert_eq!(unique_path(&base), base);

        std::fs::write(&base, b"x").unwrap();
        let second = unique_path(&base);
        assert_ne!(second, base);
        std::fs::write(&second, b"y").unwrap();

        let third = unique_path(&base);
        assert_ne!(third, base);
        assert_ne!(third, second);
    }
}
