use std::path::Path;

use url::Url;

use crate::error::{FetchErrorKind, FetchFailure};
use crate::graph::url_info::{Content, UrlType};
use crate::plugin::{FetchResult, Plugin};

/// Content type for a file on disk. Extensions mime_guess gets wrong for web sources
/// (`.ts` is a video container to it) are mapped first.
pub fn content_type_for_path(path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let known = match extension.as_str() {
        "js" | "mjs" | "cjs" | "jsx" | "ts" | "tsx" | "mts" => Some("text/javascript"),
        "map" => Some("application/json"),
        "webmanifest" => Some("application/manifest+json"),
        "html" | "htm" => Some("text/html"),
        "css" => Some("text/css"),
        _ => None,
    };
    match known {
        Some(content_type) => content_type.to_owned(),
        None => mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned(),
    }
}

/// Keep bytes as text when the content type says so and they are valid UTF-8.
pub fn content_from_bytes(bytes: Vec<u8>, content_type: &str) -> Content {
    if UrlType::from_content_type(content_type).is_textual() {
        match String::from_utf8(bytes) {
            Ok(text) => Content::Text(text),
            Err(err) => Content::Binary(err.into_bytes()),
        }
    } else {
        Content::Binary(bytes)
    }
}

async fn fetch_file(url: &str) -> anyhow::Result<Option<FetchResult>> {
    let Ok(parsed) = Url::parse(url) else {
        return Ok(None);
    };
    if parsed.scheme() != "file" {
        return Ok(None);
    }
    let path = parsed
        .to_file_path()
        .map_err(|_| FetchFailure::new(FetchErrorKind::NotFound, format!("{url} is not a file path")))?;
    let metadata = tokio::fs::metadata(&path).await?;
    if metadata.is_dir() {
        return Err(FetchFailure::new(
            FetchErrorKind::DirectoryReferenceNotAllowed,
            format!("{} is a directory", path.display()),
        )
        .into());
    }
    let bytes = tokio::fs::read(&path).await?;
    let content_type = content_type_for_path(&path);
    Ok(Some(FetchResult {
        content: Some(content_from_bytes(bytes, &content_type)),
        content_type: Some(content_type),
        ..FetchResult::default()
    }))
}

/// Reads `file:` urls from disk.
pub fn file_urls() -> Plugin {
    Plugin::new("file_urls").on_fetch_url_content(|input| async move { fetch_file(input.url()).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KitchenError;

    #[test]
    fn test_content_type_for_web_sources() {
        assert_eq!(content_type_for_path(Path::new("a.ts")), "text/javascript");
        assert_eq!(content_type_for_path(Path::new("a.png")), "image/png");
        assert_eq!(content_type_for_path(Path::new("a.js.map")), "application/json");
    }

    #[tokio::test]
    async fn test_fetch_reads_text_and_binary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.css"), "a {}").unwrap();
        std::fs::write(dir.path().join("a.png"), [0x89, 0x50]).unwrap();
        let css = Url::from_file_path(dir.path().join("a.css")).unwrap();
        let png = Url::from_file_path(dir.path().join("a.png")).unwrap();

        let result = fetch_file(css.as_str()).await.unwrap().unwrap();
        assert_eq!(result.content, Some(Content::from("a {}")));
        let result = fetch_file(png.as_str()).await.unwrap().unwrap();
        assert_eq!(result.content, Some(Content::Binary(vec![0x89, 0x50])));
    }

    #[tokio::test]
    async fn test_fetch_failures_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Url::from_file_path(dir.path().join("missing.js")).unwrap();
        let err = fetch_file(missing.as_str()).await.unwrap_err();
        let io_error = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);

        let dir_url = Url::from_directory_path(dir.path()).unwrap();
        let err = fetch_file(dir_url.as_str()).await.unwrap_err();
        let failure = err.downcast_ref::<FetchFailure>().unwrap();
        assert_eq!(failure.kind, FetchErrorKind::DirectoryReferenceNotAllowed);
        assert!(err.downcast_ref::<KitchenError>().is_none());
    }
}
