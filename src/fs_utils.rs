use filetime::{FileTime, set_file_mtime};
use prost::Message;
use std::{
    io,
    path::{Component, Path, PathBuf},
};

use tokio::{fs::OpenOptions, io::AsyncWriteExt};

static FORBIDDEN_WINDOWS_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// returns a path component that is safe to use on Windows, Linux and Mac OS
///
/// Forbidden characters (`\ / : * ? " < > | ^ %`) and control characters are
/// replaced with '_', leading/trailing whitespace and dots are trimmed, and
/// reserved Windows device names get a trailing underscore.
pub fn cleanup_filename(input: &str) -> String {
    let mut result: String = input
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '%' | '*' | ':' | '|' | '"' | '<' | '>' | '^' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();
    result = result
        .trim_matches(|c: char| c.is_whitespace() || c == '.')
        .to_string();

    let upper_result = result.to_ascii_uppercase();
    if FORBIDDEN_WINDOWS_NAMES
        .iter()
        .any(|&name| name == upper_result)
    {
        result.push('_');
    }

    if result.len() > 255 {
        let mut cut = 255;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result.truncate(cut);
    }
    result
}

/// Turns a descriptor file name such as `dir/sub/file.iso` into a relative
/// path whose every component went through [cleanup_filename].
///
/// Returns None for absolute paths, `..` components, or names that clean up
/// to nothing.
pub fn sanitize_relative_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return None;
    }
    let mut out = PathBuf::new();
    for raw in normalized.split('/') {
        if raw.is_empty() || raw == "." {
            continue;
        }
        if raw == ".." {
            return None;
        }
        let cleaned = cleanup_filename(raw);
        if cleaned.is_empty() {
            return None;
        }
        out.push(cleaned);
    }
    let only_normal = out
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if out.as_os_str().is_empty() || !only_normal {
        return None;
    }
    Some(out)
}

/// Sets the last modified time of the file at `path` to a UNIX timestamp (seconds).
pub async fn set_file_mtime_async<P: AsRef<Path>>(path: &P, unix_time_secs: i64) -> io::Result<()> {
    let file_time = FileTime::from_unix_time(unix_time_secs, 0);
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || set_file_mtime(&path, file_time)).await??;
    Ok(())
}

pub fn get_metadl_dir() -> PathBuf {
    dirs::data_dir()
        .map(|mut path| {
            path.push("metadl");
            path
        })
        .unwrap_or_else(|| std::env::temp_dir().join("metadl"))
}

/// reads a protobuf delimited encoded message of Type `M` and return if successful
pub async fn read_delimited_message_from_path<M: Message + Default, P: AsRef<Path>>(
    path: &P,
) -> io::Result<M> {
    let buf = tokio::fs::read(path).await?;
    M::decode_length_delimited(&*buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn atomic_replace(src: PathBuf, dst: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || atomicwrites::replace_atomic(&src, &dst))
        .await
        .map_err(io::Error::other)??;

    Ok(())
}

/// Atomically writes the given bytes to the specified path.
/// Writes to `tmp_path` in the same directory, syncs it, then renames it over
/// the target. Truncates `tmp_path` if it exists.
pub async fn atomic_write(path: PathBuf, tmp_path: PathBuf, data: &[u8]) -> io::Result<()> {
    {
        let mut tmp_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        tmp_file.write_all(data).await?;
        tmp_file.sync_all().await?;
    }

    atomic_replace(tmp_path, path).await
}

/// Opens (creating if needed) the destination and sets its length when
/// known, so workers can write disjoint ranges at fixed offsets.
pub async fn prepare_destination(path: &Path, size: Option<u64>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    if let Some(size) = size {
        let current = file.metadata().await?.len();
        if current != size {
            file.set_len(size).await?;
        }
    }
    Ok(())
}

pub async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_cleanup_filename_basic() {
        assert_eq!(cleanup_filename("normal_filename.txt"), "normal_filename.txt");
        assert_eq!(cleanup_filename("file:with:colon.txt"), "file_with_colon.txt");
        assert_eq!(cleanup_filename("file|with|pipe.txt"), "file_with_pipe.txt");
        assert_eq!(cleanup_filename("file\u{0000}name.txt"), "file_name.txt");
        assert_eq!(cleanup_filename("   ...filename.txt...   "), "filename.txt");
    }

    #[test]
    fn test_cleanup_filename_forbidden_windows_names() {
        for &name in FORBIDDEN_WINDOWS_NAMES {
            assert_eq!(cleanup_filename(name), format!("{name}_"));
        }
    }

    #[test]
    fn test_cleanup_filename_truncates_on_char_boundary() {
        let long_name = "ф".repeat(200);
        let cleaned = cleanup_filename(&long_name);
        assert!(cleaned.len() <= 255);
        assert!(cleaned.chars().all(|c| c == 'ф'));
    }

    #[test]
    fn sanitize_keeps_subdirectories() {
        assert_eq!(
            sanitize_relative_path("isos/debian:12.iso"),
            Some(PathBuf::from("isos").join("debian_12.iso"))
        );
        assert_eq!(
            sanitize_relative_path("./a//b.txt"),
            Some(PathBuf::from("a").join("b.txt"))
        );
    }

    #[test]
    fn sanitize_rejects_traversal_and_absolute_names() {
        assert_eq!(sanitize_relative_path("../etc/passwd"), None);
        assert_eq!(sanitize_relative_path("a/../../b"), None);
        assert_eq!(sanitize_relative_path("/etc/passwd"), None);
        assert_eq!(sanitize_relative_path("\\windows\\system32"), None);
        assert_eq!(sanitize_relative_path(""), None);
        assert_eq!(sanitize_relative_path("..."), None);
    }

    #[tokio::test]
    async fn prepare_destination_presizes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");
        prepare_destination(&path, Some(250)).await.unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 250);
        prepare_destination(&path, None).await.unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 250);
    }

    #[tokio::test]
    async fn atomic_write_replaces_target_and_consumes_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record");
        let tmp = dir.path().join("record.tmp");
        fs::write(&path, b"old").unwrap();
        atomic_write(path.clone(), tmp.clone(), b"new").await.unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_set_file_mtime_async_sets_mtime() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("mtime_test.txt");
        fs::write(&file_path, b"test").unwrap();

        let unix_time = 1_600_000_000i64;
        set_file_mtime_async(&file_path, unix_time).await.unwrap();

        let metadata = fs::metadata(&file_path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            assert_eq!(metadata.mtime(), unix_time);
        }
        #[cfg(not(unix))]
        {
            assert!(metadata.modified().is_ok());
        }
    }

    #[tokio::test]
    async fn remove_missing_file_is_ok() {
        let dir = tempdir().unwrap();
        remove_file_if_exists(&dir.path().join("nope")).await.unwrap();
    }
}
