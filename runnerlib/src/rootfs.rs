//! Per-job root filesystem provisioning.
//!
//! Before a job forks, the rootfs template is copied into the job's scratch
//! directory; after the child is reaped the whole subtree is removed.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

/// Recursively copy the rootfs template from `src` to `dst`.
///
/// Symlinks are recreated (not followed) and permissions are preserved.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        symlink(target, dst)?;
    } else if file_type.is_dir() {
        fs::create_dir(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        // applied last so a read-only directory can still be populated
        fs::set_permissions(dst, meta.permissions())?;
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}
