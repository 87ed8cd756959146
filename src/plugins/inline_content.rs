use crate::graph::reference::line_column;
use crate::plugin::{FetchResult, Plugin};
use crate::url_meta::strip_search_and_hash;

/// Url of content embedded in `owner_url` between byte offsets `start..end` of
/// `owner_content`: `<owner>@L<line>C<column>-L<line>C<column>.<extension>`.
pub fn inline_content_url(
    owner_url: &str,
    owner_content: &str,
    start: usize,
    end: usize,
    extension: &str,
) -> String {
    let (start_line, start_column) = line_column(owner_content, start);
    let (end_line, end_column) = line_column(owner_content, end);
    format!(
        "{}@L{start_line}C{start_column}-L{end_line}C{end_column}.{extension}",
        strip_search_and_hash(owner_url)
    )
}

/// Serves the content carried by inline references.
pub fn inline_content() -> Plugin {
    Plugin::new("inline_content").on_fetch_url_content(|input| {
        let result = input.first_reference.as_ref().and_then(|reference| {
            let content = reference.content.clone()?;
            let content_type = reference
                .content_type
                .clone()
                .unwrap_or_else(|| "text/plain".to_owned());
            Some(FetchResult::new(content, content_type))
        });
        async move { Ok(result) }
    })
}
