//! Utility functions for query encoding, identifiers and file names

use reqwest::header::{CONTENT_DISPOSITION, HeaderMap};

/// Characters left untouched by default query encoding
///
/// This is the RFC 3986 query character set minus the item delimiters
/// (`&`, `=`, `#`). Note that `+` and `,` stay literal.
const QUERY_ALLOWED: &str = "-._~!$'()*+,;:@/?";

/// Percent-encode a query key or value using the default rules
///
/// # Examples
///
/// ```
/// use wirekit::utils::encode_query_component;
///
/// assert_eq!(encode_query_component("a b&c"), "a%20b%26c");
/// assert_eq!(encode_query_component("12:13+0100"), "12:13+0100");
/// ```
pub fn encode_query_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    let mut buf = [0u8; 4];
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || QUERY_ALLOWED.contains(ch) {
            encoded.push(ch);
        } else {
            encoded.push_str(&urlencoding::encode(ch.encode_utf8(&mut buf)));
        }
    }
    encoded
}

/// Default encoding plus `+` escaped as `%2B`
///
/// Servers commonly decode a literal `+` in a query as a space, which breaks
/// values such as timezone offsets.
pub fn encode_query_component_plus(raw: &str) -> String {
    encode_query_component(raw).replace('+', "%2B")
}

/// Reduce an arbitrary string to a file-name-safe identifier
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Extract a file name for a downloaded resource
///
/// Tries `Content-Disposition` (`filename=` and RFC 5987 `filename*=`) first,
/// then the last segment of the URL path, then falls back to `"download"`.
///
/// # Examples
///
/// ```
/// use reqwest::header::HeaderMap;
/// use wirekit::utils::extract_filename;
///
/// let url = url::Url::parse("https://example.com/files/report.pdf").unwrap();
/// assert_eq!(extract_filename(&HeaderMap::new(), &url), "report.pdf");
/// ```
pub fn extract_filename(headers: &HeaderMap, url: &url::Url) -> String {
    if let Some(content_disposition) = headers.get(CONTENT_DISPOSITION)
        && let Ok(value) = content_disposition.to_str()
    {
        // attachment; filename="file.zip" or filename*=UTF-8''file.zip
        for part in value.split(';') {
            let part = part.trim();
            if let Some(filename) = part.strip_prefix("filename*=") {
                if let Some(idx) = filename.rfind('\'')
                    && let Ok(decoded) = urlencoding::decode(&filename[idx + 1..])
                    && let Some(name) = safe_file_name(decoded.as_ref())
                {
                    return name;
                }
            } else if let Some(filename) = part.strip_prefix("filename=")
                && let Some(name) = safe_file_name(filename.trim_matches('"'))
            {
                return name;
            }
        }
    }

    if let Some(mut segments) = url.path_segments()
        && let Some(last_segment) = segments.next_back()
        && let Ok(decoded) = urlencoding::decode(last_segment)
        && let Some(name) = safe_file_name(decoded.as_ref())
    {
        return name;
    }

    "download".to_string()
}

/// Keep only the final path component so a header cannot escape the target directory
fn safe_file_name(candidate: &str) -> Option<String> {
    std::path::Path::new(candidate)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn default_encoding_keeps_plus_and_colon() {
        assert_eq!(
            encode_query_component("2023-11-29T12:13:04.598+0100"),
            "2023-11-29T12:13:04.598+0100"
        );
    }

    #[test]
    fn plus_encoding_escapes_plus() {
        assert_eq!(
            encode_query_component_plus("2023-11-29T12:13:04.598+0100"),
            "2023-11-29T12:13:04.598%2B0100"
        );
    }

    #[test]
    fn delimiters_and_unicode_are_escaped() {
        assert_eq!(encode_query_component("a=b&c#d"), "a%3Db%26c%23d");
        assert_eq!(encode_query_component("é"), "%C3%A9");
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_identifier("GET_/a/b?x=1"), "GET_-a-b-x-1");
    }

    #[test]
    fn filename_from_content_disposition() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"movie.mkv\""),
        );
        let url = url::Url::parse("https://example.com/dl?id=1").unwrap();
        assert_eq!(extract_filename(&headers, &url), "movie.mkv");
    }

    #[test]
    fn filename_from_rfc5987_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename*=UTF-8''my%20file.txt"),
        );
        let url = url::Url::parse("https://example.com/dl").unwrap();
        assert_eq!(extract_filename(&headers, &url), "my file.txt");
    }

    #[test]
    fn filename_header_cannot_traverse() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"../../etc/passwd\""),
        );
        let url = url::Url::parse("https://example.com/").unwrap();
        assert_eq!(extract_filename(&headers, &url), "passwd");
    }

    #[test]
    fn filename_falls_back_to_default() {
        let url = url::Url::parse("https://example.com/").unwrap();
        assert_eq!(extract_filename(&HeaderMap::new(), &url), "download");
    }
}
