use std::cmp::Ordering;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::debug;

use crate::graph::url_info::Content;

/// What a build produced. Keys are paths relative to the build directory, with forward
/// slashes, sorted with [`compare_file_urls`].
#[derive(Debug, Clone, Default)]
pub struct BuildInfo {
    /// Files to write.
    pub build_file_contents: IndexMap<String, Content>,
    /// Content living inside another build file (inline scripts and styles).
    pub build_inline_contents: IndexMap<String, String>,
    /// Unversioned path -> versioned path.
    pub build_manifest: IndexMap<String, String>,
}

impl BuildInfo {
    /// Sort every table the way build output is listed.
    pub fn sorted(mut self) -> Self {
        self.build_file_contents.sort_by(|a, _, b, _| compare_file_urls(a, b));
        self.build_inline_contents.sort_by(|a, _, b, _| compare_file_urls(a, b));
        self.build_manifest.sort_by(|a, _, b, _| compare_file_urls(a, b));
        self
    }
}

/// Order paths so that, at equal depth, files come before directories; names compare
/// case-sensitively.
pub fn compare_file_urls(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<&str> = a.split('/').collect();
    let b_parts: Vec<&str> = b.split('/').collect();
    for i in 0..a_parts.len().max(b_parts.len()) {
        let (Some(a_name), Some(b_name)) = (a_parts.get(i), b_parts.get(i)) else {
            return a_parts.len().cmp(&b_parts.len());
        };
        let a_is_dir = i + 1 < a_parts.len();
        let b_is_dir = i + 1 < b_parts.len();
        match (a_is_dir, b_is_dir) {
            (false, true) => return Ordering::Less,
            (true, false) => return Ordering::Greater,
            _ => {}
        }
        match a_name.cmp(b_name) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn native_path(build_directory: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(build_directory.to_path_buf(), |path, part| path.join(part))
}

/// Write every build file under `build_directory`. Each file goes to a temp file in the
/// same directory first, then is renamed over the destination.
pub fn write_build_files(build_directory: &Path, info: &BuildInfo) -> anyhow::Result<usize> {
    std::fs::create_dir_all(build_directory)?;
    for (relative, content) in &info.build_file_contents {
        let target = native_path(build_directory, relative);
        let parent = target.parent().unwrap_or(build_directory);
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().flush()?;
        tmp.persist(&target)?;
        debug!(path = %target.display(), bytes = content.len(), "build file written");
    }
    Ok(info.build_file_contents.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_before_directories_at_same_depth() {
        let mut paths = vec![
            "assets/js/main.js",
            "index.html",
            "assets/css/b.css",
            "about.html",
            "assets/robots.txt",
            "Zed.html",
        ];
        paths.sort_by(|a, b| compare_file_urls(a, b));
        assert_eq!(
            paths,
            vec![
                "Zed.html",
                "about.html",
                "index.html",
                "assets/robots.txt",
                "assets/css/b.css",
                "assets/js/main.js",
            ]
        );
    }

    #[test]
    fn test_write_build_files_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = BuildInfo::default();
        info.build_file_contents
            .insert("assets/js/a-1a2b3c4d.js".into(), Content::Text("a()".into()));
        info.build_file_contents
            .insert("index.html".into(), Content::Text("<html></html>".into()));
        let written = write_build_files(dir.path(), &info).unwrap();
        assert_eq!(written, 2);
        let js = std::fs::read_to_string(dir.path().join("assets/js/a-1a2b3c4d.js")).unwrap();
        assert_eq!(js, "a()");
    }
}
