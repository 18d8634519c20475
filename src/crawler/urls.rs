use std::collections::HashSet;

use regex::Regex;
use url::Url;

use super::element::ElementDescriptor;

/// Normalize a raw URL for queueing.
///
/// Accepts http/https only; a scheme-relative `//host/...` is coerced to http.
/// The fragment is stripped, the query is kept. Returns `None` for anything
/// unusable (not an error, the URL is simply dropped).
pub fn clean_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = if trimmed.starts_with("//") {
        format!("http:{trimmed}")
    } else {
        trimmed.to_string()
    };

    let mut parsed = Url::parse(&candidate).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.host_str()?;

    parsed.set_fragment(None);
    Some(parsed.to_string())
}

fn has_excluded_prefix(href: &str) -> bool {
    let lower = href.trim().to_ascii_lowercase();
    lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with('#')
}

/// Pull candidate URLs out of element attributes.
///
/// Looks at `href` (links), `action` (forms) and inline `onclick` handlers;
/// relative values are resolved against the page URL. The result is
/// deduplicated but not yet cleaned or filtered against the known set.
pub fn extract_urls(elements: &[ElementDescriptor], base_url: &str) -> Vec<String> {
    let base = Url::parse(base_url).ok();
    let onclick_re = Regex::new(r#"['"](https?://[^'"]+)['"]"#).ok();

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    let mut push = |candidate: String| {
        if seen.insert(candidate.clone()) {
            urls.push(candidate);
        }
    };

    for element in elements {
        if let Some(href) = element.attribute("href") {
            if !has_excluded_prefix(href) {
                if let Some(resolved) = resolve(&base, href) {
                    push(resolved);
                }
            }
        }

        if let Some(action) = element.attribute("action") {
            let lower = action.trim().to_ascii_lowercase();
            if !action.trim().is_empty() && !lower.starts_with("javascript:") {
                if let Some(resolved) = resolve(&base, action) {
                    push(resolved);
                }
            }
        }

        if let (Some(onclick), Some(re)) = (element.attribute("onclick"), onclick_re.as_ref()) {
            for capture in re.captures_iter(onclick) {
                if let Some(m) = capture.get(1) {
                    push(m.as_str().to_string());
                }
            }
        }
    }

    urls
}

/// Pull the `<loc>` entries out of a sitemap document.
///
/// Works for both `urlset` and `sitemapindex` payloads; the caller decides
/// whether a returned location is a page or a nested sitemap.
pub fn sitemap_locations(xml: &str) -> Vec<String> {
    let Ok(re) = Regex::new(r"<loc>\s*([^<]+?)\s*</loc>") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut locations = Vec::new();
    for capture in re.captures_iter(xml) {
        if let Some(m) = capture.get(1) {
            let value = m.as_str().trim().to_string();
            if seen.insert(value.clone()) {
                locations.push(value);
            }
        }
    }
    locations
}

fn resolve(base: &Option<Url>, value: &str) -> Option<String> {
    match base {
        Some(base) => base.join(value.trim()).ok().map(|u| u.to_string()),
        None => Url::parse(value.trim()).ok().map(|u| u.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::element::{InteractionVerb, SuggestedInteraction};
    use std::collections::HashMap;

    fn link(attrs: &[(&str, &str)]) -> ElementDescriptor {
        ElementDescriptor {
            element_path: "/html/body/a[1]".to_string(),
            tag_name: "a".to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            interaction: SuggestedInteraction {
                action: InteractionVerb::Click,
            },
        }
    }

    #[test]
    fn clean_url_strips_fragment_keeps_query() {
        assert_eq!(
            clean_url("http://x.com/a?x=1#frag").as_deref(),
            Some("http://x.com/a?x=1")
        );
    }

    #[test]
    fn clean_url_rejects_non_http_schemes() {
        assert_eq!(clean_url("javascript:void(0)"), None);
        assert_eq!(clean_url("mailto:a@b.com"), None);
        assert_eq!(clean_url("ftp://x.com/file"), None);
    }

    #[test]
    fn clean_url_coerces_missing_scheme_to_http() {
        assert_eq!(clean_url("//x.com/a").as_deref(), Some("http://x.com/a"));
    }

    #[test]
    fn clean_url_rejects_hostless_input() {
        assert_eq!(clean_url(""), None);
        assert_eq!(clean_url("not a url"), None);
    }

    #[test]
    fn extract_resolves_relative_hrefs() {
        let urls = extract_urls(&[link(&[("href", "/about")])], "http://example.com/");
        assert_eq!(urls, vec!["http://example.com/about"]);
    }

    #[test]
    fn extract_skips_javascript_and_fragment_hrefs() {
        let elements = vec![
            link(&[("href", "javascript:void(0)")]),
            link(&[("href", "#top")]),
            link(&[("href", "mailto:a@b.com")]),
            link(&[("href", "tel:+123")]),
        ];
        assert!(extract_urls(&elements, "http://example.com/").is_empty());
    }

    #[test]
    fn sitemap_locations_come_from_loc_tags() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>http://example.com/a</loc></url>
  <url><loc> http://example.com/b </loc></url>
  <url><loc>http://example.com/a</loc></url>
</urlset>"#;
        assert_eq!(
            sitemap_locations(xml),
            vec!["http://example.com/a", "http://example.com/b"]
        );
        assert!(sitemap_locations("<html>no sitemap here</html>").is_empty());
    }

    #[test]
    fn extract_takes_form_actions_and_onclick_literals() {
        let elements = vec![
            link(&[("action", "/search")]),
            link(&[("onclick", "window.open('https://x.com/promo')")]),
        ];
        let urls = extract_urls(&elements, "http://example.com/");
        assert!(urls.contains(&"http://example.com/search".to_string()));
        assert!(urls.contains(&"https://x.com/promo".to_string()));
    }
}
