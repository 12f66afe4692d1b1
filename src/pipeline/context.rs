//! Per-site context.
//!
//! A `SiteContext` is built once per discovered site and never mutated:
//! each stage takes the current value and returns an updated copy, which
//! is then shared read-only (behind an `Arc`) with every fetcher and
//! processor.

use std::sync::OnceLock;

use regex::Regex;

use super::discovery::DiscoveredSite;
use crate::error::FetchError;
use crate::store::Entity;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteContext {
    /// Canonical URL as discovered.
    pub url: String,
    pub domain: String,
    /// Record in the knowledge base describing this site, if known.
    pub record_id: Option<String>,
    /// MediaWiki action API (`.../api.php`).
    pub action_api: Option<String>,
    /// MediaWiki REST API (`.../rest.php`).
    pub rest_api: Option<String>,
    pub title: Option<String>,
    /// Content of the `generator` meta tag, e.g. `MediaWiki 1.41.0`.
    pub generator: Option<String>,
    /// Record snapshot taken while building the context. Only used for
    /// decisions that tolerate staleness; the engine re-reads before
    /// writing.
    pub record: Option<Entity>,
}

impl SiteContext {
    pub fn from_site(site: &DiscoveredSite) -> Result<Self, FetchError> {
        let parsed =
            url::Url::parse(&site.url).map_err(|_| FetchError::InvalidUrl(site.url.clone()))?;
        let domain = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(site.url.clone()))?
            .to_string();
        Ok(Self {
            url: site.url.clone(),
            domain,
            record_id: site.record_id.clone(),
            ..Self::default()
        })
    }

    /// Derive API endpoints and page metadata from the home page HTML.
    pub fn with_home_page(self, html: &str) -> Self {
        let action_api = edit_uri(html).and_then(|href| resolve_api(&self.url, &href));
        let rest_api = action_api.as_deref().and_then(rest_from_action);
        Self {
            action_api: action_api.or(self.action_api),
            rest_api: rest_api.or(self.rest_api),
            title: page_title(html).or(self.title),
            generator: meta_generator(html).or(self.generator),
            ..self
        }
    }

    pub fn with_record(self, record: Entity) -> Self {
        Self {
            record: Some(record),
            ..self
        }
    }

    /// `domain` or the record id when there is one; used in job names.
    pub fn label(&self) -> String {
        match &self.record_id {
            Some(id) => format!("{} ({})", self.domain, id),
            None => self.domain.clone(),
        }
    }
}

// Compile-once patterns.
fn link_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?is)<link\b[^>]*>"#).unwrap())
}

fn meta_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?is)<meta\b[^>]*>"#).unwrap())
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap())
}

/// One `name="value"` attribute inside a tag.
fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)([a-z][a-z0-9:-]*)\s*=\s*["']([^"']*)["']"#).unwrap())
}

fn attr(tag: &str, name: &str) -> Option<String> {
    attr_re()
        .captures_iter(tag)
        .find(|c| c[1].eq_ignore_ascii_case(name))
        .map(|c| c[2].trim().to_string())
}

/// `href` of `<link rel="EditURI">`, the RSD pointer MediaWiki puts on
/// every page.
fn edit_uri(html: &str) -> Option<String> {
    link_tag_re()
        .find_iter(html)
        .map(|m| m.as_str())
        .find(|tag| attr(tag, "rel").is_some_and(|rel| rel.eq_ignore_ascii_case("EditURI")))
        .and_then(|tag| attr(tag, "href"))
}

fn meta_generator(html: &str) -> Option<String> {
    meta_tag_re()
        .find_iter(html)
        .map(|m| m.as_str())
        .find(|tag| attr(tag, "name").is_some_and(|n| n.eq_ignore_ascii_case("generator")))
        .and_then(|tag| attr(tag, "content"))
        .filter(|c| !c.is_empty())
}

fn page_title(html: &str) -> Option<String> {
    title_re()
        .captures(html)
        .map(|c| decode_entities(c[1].trim()))
        .filter(|t| !t.is_empty())
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
}

/// Resolve the RSD href against the site URL and drop its query string,
/// leaving the bare `api.php` endpoint.
fn resolve_api(site_url: &str, href: &str) -> Option<String> {
    let base = url::Url::parse(site_url).ok()?;
    let mut api = base.join(&href.replace("&amp;", "&")).ok()?;
    api.set_query(None);
    api.set_fragment(None);
    Some(api.to_string())
}

fn rest_from_action(action_api: &str) -> Option<String> {
    action_api
        .strip_suffix("api.php")
        .map(|prefix| format!("{}rest.php", prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(url: &str) -> DiscoveredSite {
        DiscoveredSite {
            url: url.to_string(),
            record_id: Some("Q7".to_string()),
        }
    }

    const HOME: &str = r#"<!DOCTYPE html>
<html><head>
<meta charset="UTF-8"/>
<title>Example Wiki &amp; Friends</title>
<meta name="generator" content="MediaWiki 1.41.0"/>
<link rel="EditURI" type="application/rsd+xml" href="https://wiki.example/w/api.php?action=rsd"/>
</head><body></body></html>"#;

    #[test]
    fn test_from_site_extracts_domain() {
        let context = SiteContext::from_site(&site("https://wiki.example/wiki/Main_Page")).unwrap();
        assert_eq!(context.domain, "wiki.example");
        assert_eq!(context.record_id.as_deref(), Some("Q7"));
        assert!(context.action_api.is_none());
    }

    #[test]
    fn test_from_site_rejects_bad_url() {
        assert!(SiteContext::from_site(&site("not a url")).is_err());
    }

    #[test]
    fn test_home_page_fills_endpoints_and_metadata() {
        let context = SiteContext::from_site(&site("https://wiki.example/")).unwrap();
        let built = context.clone().with_home_page(HOME);

        assert_eq!(built.action_api.as_deref(), Some("https://wiki.example/w/api.php"));
        assert_eq!(built.rest_api.as_deref(), Some("https://wiki.example/w/rest.php"));
        assert_eq!(built.title.as_deref(), Some("Example Wiki & Friends"));
        assert_eq!(built.generator.as_deref(), Some("MediaWiki 1.41.0"));
        // The earlier stage value is untouched
        assert!(context.action_api.is_none());
    }

    #[test]
    fn test_protocol_relative_and_relative_edit_uri() {
        let context = SiteContext::from_site(&site("https://wiki.example/wiki/Main_Page")).unwrap();

        let protocol_relative = context.clone().with_home_page(
            r#"<link href="//wiki.example/mw/api.php?action=rsd" rel="EditURI" type="application/rsd+xml">"#,
        );
        assert_eq!(
            protocol_relative.action_api.as_deref(),
            Some("https://wiki.example/mw/api.php")
        );

        let relative = context.with_home_page(r#"<link rel='EditURI' href='/api.php?action=rsd'>"#);
        assert_eq!(relative.action_api.as_deref(), Some("https://wiki.example/api.php"));
        assert_eq!(relative.rest_api.as_deref(), Some("https://wiki.example/rest.php"));
    }

    #[test]
    fn test_attribute_names_match_whole_words() {
        let tag = r#"<link data-rel="alternate" REL="EditURI" data-href="/wrong" href="/w/api.php?action=rsd">"#;
        assert_eq!(attr(tag, "rel").as_deref(), Some("EditURI"));
        assert_eq!(attr(tag, "href").as_deref(), Some("/w/api.php?action=rsd"));
        assert_eq!(attr(tag, "type"), None);
    }

    #[test]
    fn test_page_without_markers_leaves_fields_empty() {
        let context = SiteContext::from_site(&site("https://static.example/"))
            .unwrap()
            .with_home_page("<html><body>hello</body></html>");
        assert!(context.action_api.is_none());
        assert!(context.rest_api.is_none());
        assert!(context.title.is_none());
        assert!(context.generator.is_none());
    }

    #[test]
    fn test_with_record_attaches_snapshot() {
        let context = SiteContext::from_site(&site("https://wiki.example/"))
            .unwrap()
            .with_record(Entity::new("Q7"));
        assert_eq!(context.record.as_ref().map(|r| r.id.as_str()), Some("Q7"));
        assert_eq!(context.label(), "wiki.example (Q7)");
    }
}
