use data_url::DataUrl;

use crate::error::{FetchErrorKind, FetchFailure};
use crate::plugin::{FetchResult, Plugin};
use crate::plugins::file_urls::content_from_bytes;

fn fetch_data_url(url: &str) -> anyhow::Result<Option<FetchResult>> {
    if !url.starts_with("data:") {
        return Ok(None);
    }
    let data_url = DataUrl::process(url)
        .map_err(|err| FetchFailure::new(FetchErrorKind::ParseError, format!("invalid data url: {err:?}")))?;
    let content_type = data_url.mime_type().to_string();
    let (bytes, _fragment) = data_url
        .decode_to_vec()
        .map_err(|_| FetchFailure::new(FetchErrorKind::ParseError, "invalid base64 in data url"))?;
    Ok(Some(FetchResult {
        content: Some(content_from_bytes(bytes, &content_type)),
        content_type: Some(content_type),
        ..FetchResult::default()
    }))
}

/// Decodes `data:` urls.
pub fn data_urls() -> Plugin {
    Plugin::new("data_urls").on_fetch_url_content(|input| {
        let result = fetch_data_url(input.url());
        async move { result }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::url_info::Content;

    #[test]
    fn test_decodes_base64_and_percent_encoded() {
        let result = fetch_data_url("data:text/css;base64,YSB7fQ==").unwrap().unwrap();
        assert_eq!(result.content, Some(Content::from("a {}")));
        assert_eq!(result.content_type.as_deref(), Some("text/css"));

        let result = fetch_data_url("data:text/plain,hello%20world").unwrap().unwrap();
        assert_eq!(result.content, Some(Content::from("hello world")));
        assert!(fetch_data_url("file:///a.js").unwrap().is_none());
    }
}
