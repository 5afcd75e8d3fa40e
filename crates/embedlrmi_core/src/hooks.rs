//! Wiring between the gateway and the wiki's extension points.
//!
//! The host supplies page context and an output sink; nothing here knows about skins or
//! request objects beyond these traits.

use tracing::warn;

use crate::error::Error;
use crate::gateway::{MetadataGateway, first_node};
use crate::render::{self, messages};

/// Head item name; the host keeps one item per name.
pub const HEAD_ITEM_NAME: &str = "EmbedLrmiData";
pub const VIEW_ACTION: &str = "lrmi";
pub const TOOLBOX_ID: &str = "t-lrmi";
/// Key of the entry in the sidebar's `TOOLBOX` section.
pub const SIDEBAR_ID: &str = "lrmi";
pub const VIEW_ROBOT_POLICY: &str = "noindex,nofollow";
pub const PURGE_PAGE_NAME: &str = "PurgeLrmiCache";
pub const PURGE_RIGHT: &str = "purgelrmicache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContext {
    /// Absolute URL the resolver rewrites into the canonical identifier.
    pub full_url: String,
    /// Path used for links back to the page.
    pub local_url: String,
    pub is_content_page: bool,
}

pub trait OutputPage {
    fn add_head_item(&mut self, name: &str, markup: &str);
    fn add_html(&mut self, html: &str);
    fn set_page_title(&mut self, title: &str);
    fn set_robot_policy(&mut self, policy: &str);
}

pub trait EditTokens {
    fn edit_token(&self) -> String;
    fn matches(&self, token: &str) -> bool;
}

/// Rights held by the requesting user.
pub trait UserRights {
    fn has_right(&self, right: &str) -> bool;
}

/// Collects hook output in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HtmlBuffer {
    pub head_items: Vec<(String, String)>,
    pub body: String,
    pub title: Option<String>,
    pub robot_policy: Option<String>,
}

impl OutputPage for HtmlBuffer {
    fn add_head_item(&mut self, name: &str, markup: &str) {
        match self.head_items.iter_mut().find(|(existing, _)| existing == name) {
            Some(item) => item.1 = markup.to_string(),
            None => self.head_items.push((name.to_string(), markup.to_string())),
        }
    }

    fn add_html(&mut self, html: &str) {
        self.body.push_str(html);
    }

    fn set_page_title(&mut self, title: &str) {
        self.title = Some(title.to_string());
    }

    fn set_robot_policy(&mut self, policy: &str) {
        self.robot_policy = Some(policy.to_string());
    }
}

/// Embed the first metadata node as JSON-LD on content pages.
pub fn on_before_page_display(
    gateway: &MetadataGateway,
    page: &PageContext,
    out: &mut dyn OutputPage,
) {
    if !page.is_content_page {
        return;
    }
    if let Some(payload) = gateway.lookup_page(&page.full_url)
        && let Some(node) = first_node(&payload)
    {
        out.add_head_item(HEAD_ITEM_NAME, &render::json_ld_script(node));
    }
}

/// Handle `action=lrmi`. Returns `false` when the action was handled and the host should
/// stop processing, `true` to let other handlers run.
pub fn on_perform_action(
    gateway: &MetadataGateway,
    page: &PageContext,
    action: &str,
    out: &mut dyn OutputPage,
) -> bool {
    if action != VIEW_ACTION {
        return true;
    }
    out.set_robot_policy(VIEW_ROBOT_POLICY);
    out.set_page_title(messages::SHOW_LRMI_DATA);
    let payload = gateway.lookup_page(&page.full_url);
    out.add_html(&render::metadata_view(payload.as_ref()));
    false
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolboxLink {
    pub id: &'static str,
    pub text: &'static str,
    pub href: String,
}

/// Skin navigation toolbox entry pointing at the metadata view, for content pages only.
pub fn toolbox_link(page: &PageContext) -> Option<ToolboxLink> {
    view_link(page, TOOLBOX_ID, messages::SHOW_LRMI_DATA)
}

/// Sidebar `TOOLBOX` entry for the same view, with its own label.
pub fn sidebar_link(page: &PageContext) -> Option<ToolboxLink> {
    view_link(page, SIDEBAR_ID, messages::SHOW_LRMI_LINK)
}

fn view_link(page: &PageContext, id: &'static str, text: &'static str) -> Option<ToolboxLink> {
    if !page.is_content_page {
        return None;
    }
    let separator = if page.local_url.contains('?') { '&' } else { '?' };
    Some(ToolboxLink {
        id,
        text,
        href: format!("{}{separator}action={VIEW_ACTION}", page.local_url),
    })
}

/// Local URL of the purge special page, given the wiki's `$1`-style article path.
pub fn purge_page_url(article_path: &str) -> String {
    article_path.replace("$1", &format!("Special:{PURGE_PAGE_NAME}"))
}

/// Saved content may carry new metadata; drop what is cached for the page.
pub fn on_page_save_complete(gateway: &MetadataGateway, page: &PageContext) {
    gateway.invalidate_page(&page.full_url);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeRequest {
    pub posted: bool,
    pub action: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    FormShown,
    PermissionDenied,
    SessionFailure,
    Purged(usize),
    Unsupported,
    Failed,
}

/// The purge special page. Users without [`PURGE_RIGHT`] get an error and nothing else.
/// State only changes on a POST with `action=purge` and a valid edit token; the form is
/// rendered afterwards.
pub fn execute_purge_page(
    gateway: &MetadataGateway,
    request: &PurgeRequest,
    user: &dyn UserRights,
    tokens: &dyn EditTokens,
    action_url: &str,
    out: &mut dyn OutputPage,
) -> PurgeOutcome {
    if !user.has_right(PURGE_RIGHT) {
        out.add_html(&render::error_box(messages::PERMISSION_DENIED));
        return PurgeOutcome::PermissionDenied;
    }
    out.set_page_title(messages::PURGE_TITLE);

    let mut outcome = PurgeOutcome::FormShown;
    if request.posted && request.action.as_deref() == Some("purge") {
        let token_ok = request
            .token
            .as_deref()
            .is_some_and(|token| tokens.matches(token));
        if !token_ok {
            out.add_html(&render::error_box(messages::SESSION_FAILURE));
            out.add_html(&render::purge_form(action_url, &tokens.edit_token()));
            return PurgeOutcome::SessionFailure;
        }
        outcome = match gateway.purge_all() {
            Ok(removed) => {
                out.add_html(&render::success_box(&format!(
                    "{} ({removed} entries removed)",
                    messages::PURGE_SUCCESS
                )));
                PurgeOutcome::Purged(removed)
            }
            Err(Error::PurgeUnsupported) => {
                out.add_html(&render::error_box(messages::PURGE_UNSUPPORTED));
                PurgeOutcome::Unsupported
            }
            Err(error) => {
                warn!(%error, "LRMI cache purge failed");
                out.add_html(&render::error_box(&error.to_string()));
                PurgeOutcome::Failed
            }
        };
    }
    out.add_html(&render::purge_form(action_url, &tokens.edit_token()));
    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::error::Result;
    use crate::provider::MetadataProvider;
    use crate::resolver::RewriteRule;
    use crate::store::{CacheStore, MemoryStore};

    struct FixedProvider {
        payload: Value,
        calls: AtomicUsize,
    }

    impl MetadataProvider for FixedProvider {
        fn query(&self, _canonical_url: &str) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.payload.clone())
        }
    }

    struct StaticTokens(&'static str);

    impl EditTokens for StaticTokens {
        fn edit_token(&self) -> String {
            self.0.to_string()
        }
        fn matches(&self, token: &str) -> bool {
            token == self.0
        }
    }

    struct Rights(&'static [&'static str]);

    impl UserRights for Rights {
        fn has_right(&self, right: &str) -> bool {
            self.0.iter().any(|held| *held == right)
        }
    }

    struct FailingPurgeStore;

    impl CacheStore for FailingPurgeStore {
        fn get(&self, _key: &str) -> Result<Option<Value>> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &Value, _ttl_seconds: u64) -> Result<()> {
            Ok(())
        }
        fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        fn purge_namespace(&self, _namespace: &str) -> Result<usize> {
            Err(Error::CacheUnavailable("disk I/O error".to_string()))
        }
    }

    fn purge_post(token: &str) -> PurgeRequest {
        PurgeRequest {
            posted: true,
            action: Some("purge".to_string()),
            token: Some(token.to_string()),
        }
    }

    fn gateway(payload: Value) -> (Arc<MemoryStore>, Arc<FixedProvider>, MetadataGateway) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FixedProvider {
            payload,
            calls: AtomicUsize::new(0),
        });
        let gateway = MetadataGateway::new(
            store.clone(),
            provider.clone(),
            vec![RewriteRule::new("http://", "https://")],
            3_600,
        );
        (store, provider, gateway)
    }

    fn content_page() -> PageContext {
        PageContext {
            full_url: "http://example.org/wiki/Foo".to_string(),
            local_url: "/wiki/Foo".to_string(),
            is_content_page: true,
        }
    }

    #[test]
    fn page_display_injects_json_ld_once() {
        let (_store, provider, gateway) = gateway(json!({"nodes": [{"name": "Foo Lesson"}]}));
        let mut out = HtmlBuffer::default();
        on_before_page_display(&gateway, &content_page(), &mut out);
        on_before_page_display(&gateway, &content_page(), &mut out);
        assert_eq!(out.head_items.len(), 1);
        assert_eq!(out.head_items[0].0, HEAD_ITEM_NAME);
        assert!(out.head_items[0].1.contains(r#""name":"Foo Lesson""#));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn page_display_skips_empty_nodes_and_non_content_pages() {
        let (_store, provider, gateway) = gateway(json!({"nodes": []}));
        let mut out = HtmlBuffer::default();
        on_before_page_display(&gateway, &content_page(), &mut out);
        assert!(out.head_items.is_empty());

        let special = PageContext {
            is_content_page: false,
            ..content_page()
        };
        on_before_page_display(&gateway, &special, &mut out);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lrmi_action_renders_view_and_stops_processing() {
        let (_store, _provider, gateway) = gateway(json!({"nodes": [{"name": "Foo Lesson"}]}));
        let mut out = HtmlBuffer::default();
        assert!(on_perform_action(&gateway, &content_page(), "view", &mut out));
        assert!(out.body.is_empty());
        assert!(!on_perform_action(&gateway, &content_page(), "lrmi", &mut out));
        assert!(out.body.contains("<li><b>name</b>: Foo Lesson</li>"));
        assert_eq!(out.robot_policy.as_deref(), Some("noindex,nofollow"));
        assert_eq!(out.title.as_deref(), Some(messages::SHOW_LRMI_DATA));
    }

    #[test]
    fn other_actions_leave_title_and_robots_alone() {
        let (_store, provider, gateway) = gateway(json!({"nodes": []}));
        let mut out = HtmlBuffer::default();
        on_perform_action(&gateway, &content_page(), "edit", &mut out);
        assert!(out.title.is_none());
        assert!(out.robot_policy.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lrmi_action_without_metadata_shows_message() {
        let (_store, _provider, gateway) = gateway(json!({"nodes": []}));
        let mut out = HtmlBuffer::default();
        on_perform_action(&gateway, &content_page(), "lrmi", &mut out);
        assert!(out.body.contains(messages::NO_METADATA));
    }

    #[test]
    fn toolbox_link_only_for_content_pages() {
        let link = toolbox_link(&content_page()).expect("link");
        assert_eq!(link.id, "t-lrmi");
        assert_eq!(link.href, "/wiki/Foo?action=lrmi");

        let with_query = PageContext {
            local_url: "/index.php?title=Foo".to_string(),
            ..content_page()
        };
        assert_eq!(
            toolbox_link(&with_query).expect("link").href,
            "/index.php?title=Foo&action=lrmi"
        );
        let talk = PageContext {
            is_content_page: false,
            ..content_page()
        };
        assert!(toolbox_link(&talk).is_none());
    }

    #[test]
    fn sidebar_link_uses_its_own_label() {
        let link = sidebar_link(&content_page()).expect("link");
        assert_eq!(link.id, "lrmi");
        assert_eq!(link.text, messages::SHOW_LRMI_LINK);
        assert_eq!(link.href, "/wiki/Foo?action=lrmi");

        let talk = PageContext {
            is_content_page: false,
            ..content_page()
        };
        assert!(sidebar_link(&talk).is_none());
    }

    #[test]
    fn purge_page_url_expands_article_path() {
        assert_eq!(purge_page_url("/wiki/$1"), "/wiki/Special:PurgeLrmiCache");
        assert_eq!(
            purge_page_url("/index.php?title=$1"),
            "/index.php?title=Special:PurgeLrmiCache"
        );
    }

    #[test]
    fn save_complete_clears_cached_entry() {
        let (store, provider, gateway) = gateway(json!({"nodes": [{"name": "Foo"}]}));
        let mut out = HtmlBuffer::default();
        on_before_page_display(&gateway, &content_page(), &mut out);
        assert_eq!(store.len(), 1);

        on_page_save_complete(&gateway, &content_page());
        assert!(store.is_empty());
        on_before_page_display(&gateway, &content_page(), &mut out);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn purge_page_get_only_shows_form() {
        let (store, _provider, gateway) = gateway(json!({"nodes": []}));
        gateway.lookup_page("http://example.org/wiki/Foo");
        let mut out = HtmlBuffer::default();
        let outcome = execute_purge_page(
            &gateway,
            &PurgeRequest::default(),
            &Rights(&[PURGE_RIGHT]),
            &StaticTokens("tok"),
            "/wiki/Special:PurgeLrmiCache",
            &mut out,
        );
        assert_eq!(outcome, PurgeOutcome::FormShown);
        assert_eq!(out.title.as_deref(), Some(messages::PURGE_TITLE));
        assert!(out.body.contains(r#"name="token" value="tok""#));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn purge_page_rejects_bad_token() {
        let (store, _provider, gateway) = gateway(json!({"nodes": []}));
        gateway.lookup_page("http://example.org/wiki/Foo");
        let mut out = HtmlBuffer::default();
        let request = purge_post("forged");
        let outcome = execute_purge_page(
            &gateway,
            &request,
            &Rights(&[PURGE_RIGHT]),
            &StaticTokens("tok"),
            "/wiki/Special:PurgeLrmiCache",
            &mut out,
        );
        assert_eq!(outcome, PurgeOutcome::SessionFailure);
        assert!(out.body.contains("mw-message-box-error"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn purge_page_with_valid_token_purges() {
        let (store, _provider, gateway) = gateway(json!({"nodes": []}));
        store.set("other:keep", &json!(1), 0).expect("set");
        gateway.lookup_page("http://example.org/wiki/Foo");
        gateway.lookup_page("http://example.org/wiki/Bar");
        let mut out = HtmlBuffer::default();
        let request = purge_post("tok");
        let outcome = execute_purge_page(
            &gateway,
            &request,
            &Rights(&[PURGE_RIGHT]),
            &StaticTokens("tok"),
            "/wiki/Special:PurgeLrmiCache",
            &mut out,
        );
        assert_eq!(outcome, PurgeOutcome::Purged(2));
        assert!(out.body.contains("mw-message-box-success"));
        assert!(out.body.contains("(2 entries removed)"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn purge_page_requires_purge_right() {
        let (store, _provider, gateway) = gateway(json!({"nodes": []}));
        gateway.lookup_page("http://example.org/wiki/Foo");
        let mut out = HtmlBuffer::default();
        let outcome = execute_purge_page(
            &gateway,
            &purge_post("tok"),
            &Rights(&["edit"]),
            &StaticTokens("tok"),
            &purge_page_url("/wiki/$1"),
            &mut out,
        );
        assert_eq!(outcome, PurgeOutcome::PermissionDenied);
        assert!(out.body.contains(messages::PERMISSION_DENIED));
        assert!(!out.body.contains("<form"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn purge_page_reports_store_failure_separately() {
        let gateway = MetadataGateway::new(
            Arc::new(FailingPurgeStore),
            Arc::new(FixedProvider {
                payload: json!({}),
                calls: AtomicUsize::new(0),
            }),
            Vec::new(),
            60,
        );
        let mut out = HtmlBuffer::default();
        let outcome = execute_purge_page(
            &gateway,
            &purge_post("tok"),
            &Rights(&[PURGE_RIGHT]),
            &StaticTokens("tok"),
            &purge_page_url("/wiki/$1"),
            &mut out,
        );
        assert_eq!(outcome, PurgeOutcome::Failed);
        assert!(out.body.contains("disk I/O error"));
        assert!(!out.body.contains(messages::PURGE_UNSUPPORTED));
    }
}
