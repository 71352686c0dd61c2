//! Side-channel files on local storage: the reference tag carried across
//! `acquire` invocations, and the renewal marker.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::lease::{Tag, TAG_SIZE};
use crate::utils::SafeleaseError;

/// Sibling temp path used for atomic replacement.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn atomic_write(path: &Path, content: &[u8]) -> Result<(), SafeleaseError> {
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Loads the last observed tag from a reference file. A missing or
/// malformed file means nothing was observed yet.
pub fn load_ref_tag(path: &Path) -> Option<Tag> {
    match fs::read(path) {
        Ok(content) if content.len() == TAG_SIZE => {
            Tag::from_bytes(&content).ok()
        }
        Ok(content) => {
            pf_warn!(
                "ignoring reference file '{}' of {} bytes",
                path.display(),
                content.len()
            );
            None
        }
        Err(_) => None,
    }
}

/// Stores `tag` as the last observed tag into a reference file.
pub fn store_ref_tag(path: &Path, tag: &Tag) -> Result<(), SafeleaseError> {
    atomic_write(path, tag.as_bytes())
}

/// Records a committed renewal timestamp into a marker file.
pub async fn write_marker(
    path: &Path,
    timestamp: u64,
) -> Result<(), SafeleaseError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        atomic_write(&path, format!("{}\n", timestamp).as_bytes())
    })
    .await?
}

#[cfg(test)]
mod reffile_tests {
    use super::*;

    #[test]
    fn ref_tag_store_load() -> Result<(), SafeleaseError> {
        let path = Path::new("/tmp/test-safelease-ref-0.tag");
        let _ = fs::remove_file(path);
        assert_eq!(load_ref_tag(path), None);
        let tag = Tag::encode("host1", 12345)?;
        store_ref_tag(path, &tag)?;
        assert_eq!(load_ref_tag(path), Some(tag));
        store_ref_tag(path, &Tag::free())?;
        assert_eq!(load_ref_tag(path), Some(Tag::free()));
        Ok(())
    }

    #[test]
    fn ref_tag_malformed() -> Result<(), SafeleaseError> {
        let path = Path::new("/tmp/test-safelease-ref-1.tag");
        fs::write(path, b"garbage")?;
        assert_eq!(load_ref_tag(path), None);
        Ok(())
    }

    #[tokio::test]
    async fn marker_written() -> Result<(), SafeleaseError> {
        let path = Path::new("/tmp/test-safelease-marker-0");
        write_marker(path, 987654321).await?;
        assert_eq!(fs::read_to_string(path)?, "987654321\n");
        assert!(!temp_path(path).exists());
        Ok(())
    }
}
