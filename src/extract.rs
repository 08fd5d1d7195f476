//! Address extraction: the per-conversation scrape and the text-scanning
//! primitives shared with the list harvester.

use std::collections::BTreeSet;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::browser::BrowserHandle;
use crate::config::Config;
use crate::error::AutomationError;
use crate::selectors;

/// Address-shaped substrings. Deliberately plausibility-level, not full
/// RFC 5322: the inputs are rendered UI text, not message headers.
static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[A-Za-z0-9][A-Za-z0-9._%+-]*@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+",
    )
    .expect("address pattern compiles")
});

const DEFAULT_EXCLUDED_DOMAINS: &[&str] = &["example.com", "example.org", "contoso.com"];

const DEFAULT_EXCLUDED_LOCAL_PARTS: &[&str] = &[
    "noreply",
    "no-reply",
    "donotreply",
    "do-not-reply",
    "postmaster",
    "mailer-daemon",
];

const READING_PANE_WAIT: Duration = Duration::from_secs(8);
const OPEN_SETTLE_MS: u64 = 1_200;
const EXPAND_SETTLE_MS: u64 = 800;
const SUGGESTION_SETTLE_MS: u64 = 1_200;

/// Filters obvious false positives out of the harvested set.
#[derive(Debug, Clone)]
pub struct ExclusionList {
    domains: Vec<String>,
    local_parts: Vec<String>,
}

impl ExclusionList {
    pub fn from_config(config: &Config) -> Self {
        let mut domains: Vec<String> = DEFAULT_EXCLUDED_DOMAINS
            .iter()
            .map(|d| d.to_string())
            .collect();
        domains.extend(config.excluded_domains.iter().map(|d| d.to_lowercase()));
        let mut local_parts: Vec<String> = DEFAULT_EXCLUDED_LOCAL_PARTS
            .iter()
            .map(|p| p.to_string())
            .collect();
        local_parts.extend(config.excluded_local_parts.iter().map(|p| p.to_lowercase()));
        Self {
            domains,
            local_parts,
        }
    }

    /// `addr` must already be lowercase.
    fn allows(&self, addr: &str) -> bool {
        let Some((local, domain)) = addr.split_once('@') else {
            return false;
        };
        if self
            .domains
            .iter()
            .any(|d| domain == d || domain.ends_with(&format!(".{d}")))
        {
            return false;
        }
        !self.local_parts.iter().any(|p| local == p)
    }
}

impl Default for ExclusionList {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Scan arbitrary text for address-shaped substrings; lowercase, dedup and
/// filter into `out`.
pub fn scan_addresses(text: &str, exclude: &ExclusionList, out: &mut BTreeSet<String>) {
    for found in ADDRESS_RE.find_iter(text) {
        let addr = found.as_str().to_lowercase();
        if exclude.allows(&addr) {
            out.insert(addr);
        }
    }
}

/// Opens one rendered list item, expands the thread and scrapes every
/// address-bearing surface, then hands navigation restoration back to the
/// harvester.
pub struct ConversationExtractor<'a> {
    browser: &'a BrowserHandle,
    exclude: &'a ExclusionList,
}

impl<'a> ConversationExtractor<'a> {
    pub fn new(browser: &'a BrowserHandle, exclude: &'a ExclusionList) -> Self {
        Self { browser, exclude }
    }

    /// Open the item at `index` and union three extraction strategies:
    /// whole-page text scan, header-field cascade, and every
    /// `aria-label`/`title` attribute. Returns `None` when nothing at all
    /// address-shaped was found; callers may treat that like an empty set.
    /// Extraction faults are caught right here and also read as `None`;
    /// they never escape this boundary.
    pub async fn extract(&self, index: usize) -> Option<BTreeSet<String>> {
        match self.try_extract(index).await {
            Ok(found) if found.is_empty() => None,
            Ok(found) => Some(found),
            Err(fault) => {
                debug!(index, "{fault}");
                None
            }
        }
    }

    async fn try_extract(&self, index: usize) -> Result<BTreeSet<String>, AutomationError> {
        if !self.open_item(index).await {
            return Err(AutomationError::Extraction {
                detail: format!("list item {index} did not open"),
            });
        }
        if self
            .browser
            .wait_for_any(selectors::READING_PANE, READING_PANE_WAIT)
            .await
            .is_none()
        {
            return Err(AutomationError::Extraction {
                detail: format!("reading pane never appeared for item {index}"),
            });
        }
        self.expand_thread().await;

        let strings: Vec<String> = self
            .browser
            .evaluate_json(&collect_strings_script())
            .await
            .ok_or_else(|| AutomationError::Extraction {
                detail: format!("page scrape returned nothing for item {index}"),
            })?;

        let mut found = BTreeSet::new();
        for text in &strings {
            scan_addresses(text, self.exclude, &mut found);
        }
        Ok(found)
    }

    /// Try the back-to-list controls and report whether the list is
    /// visible again. The harvester escalates (Escape, then reload) when
    /// this fails.
    pub async fn restore(&self) -> bool {
        for sel in selectors::BACK_TO_LIST {
            if self.browser.click_selector(sel, 600).await {
                break;
            }
        }
        self.browser
            .wait_for_any(selectors::LIST_CONTAINERS, Duration::from_secs(3))
            .await
            .is_some()
    }

    async fn open_item(&self, index: usize) -> bool {
        let script = format!(
            r#"
            (() => {{
                const sels = {item_sels};
                for (const s of sels) {{
                    const items = document.querySelectorAll(s);
                    if (items.length > {index}) {{
                        items[{index}].click();
                        return true;
                    }}
                }}
                return false;
            }})()
            "#,
            item_sels = selectors::js_array(selectors::LIST_ITEMS),
        );
        let clicked = self.browser.evaluate_bool(&script).await;
        if clicked {
            tokio::time::sleep(Duration::from_millis(OPEN_SETTLE_MS)).await;
        }
        clicked
    }

    /// Best-effort: click every expansion trigger that is present. Never
    /// required for the extraction to succeed.
    async fn expand_thread(&self) {
        let script = format!(
            r#"
            (() => {{
                const sels = {expander_sels};
                let clicked = 0;
                for (const s of sels) {{
                    document.querySelectorAll(s).forEach(el => {{
                        el.click();
                        clicked++;
                    }});
                }}
                return clicked > 0;
            }})()
            "#,
            expander_sels = selectors::js_array(selectors::THREAD_EXPANDERS),
        );
        if self.browser.evaluate_bool(&script).await {
            tokio::time::sleep(Duration::from_millis(EXPAND_SETTLE_MS)).await;
        }
    }
}

fn collect_strings_script() -> String {
    format!(
        r#"
        (() => {{
            const out = [];
            if (document.body && document.body.innerText) {{
                out.push(document.body.innerText);
            }}
            for (const el of document.querySelectorAll('[aria-label]')) {{
                const v = el.getAttribute('aria-label');
                if (v && v.includes('@')) out.push(v);
            }}
            for (const el of document.querySelectorAll('[title]')) {{
                const v = el.getAttribute('title');
                if (v && v.includes('@')) out.push(v);
            }}
            const headers = {header_sels};
            for (const s of headers) {{
                for (const el of document.querySelectorAll(s)) {{
                    const t = el.textContent;
                    if (t) out.push(t);
                }}
            }}
            return JSON.stringify(out);
        }})()
        "#,
        header_sels = selectors::js_array(selectors::HEADER_FIELDS),
    )
}

pub const DEFAULT_SUGGESTION_SEEDS: &[&str] = &["a", "e", "i", "o", "u", "s"];

/// Scrape the compose view's recipient-suggestion flyout: open a draft,
/// type each seed prefix, read the offered contacts, discard the draft.
/// Entirely best-effort; per-seed failures are skipped.
pub async fn harvest_suggestions(
    browser: &BrowserHandle,
    exclude: &ExclusionList,
    seeds: &[String],
) -> BTreeSet<String> {
    let mut found = BTreeSet::new();

    let mut opened = false;
    for sel in selectors::COMPOSE_BUTTONS {
        if browser.click_selector(sel, 1_500).await {
            opened = true;
            break;
        }
    }
    if !opened {
        debug!("compose button not found, skipping suggestion harvest");
        return found;
    }
    let Some(recipient_sel) = browser
        .wait_for_any(selectors::RECIPIENT_FIELDS, Duration::from_secs(8))
        .await
    else {
        debug!("recipient field never appeared");
        discard_draft(browser).await;
        return found;
    };

    for seed in seeds {
        if !browser.click_selector(recipient_sel, 200).await {
            continue;
        }
        if !clear_field(browser, recipient_sel).await {
            continue;
        }
        if !browser.type_text(seed).await {
            continue;
        }
        tokio::time::sleep(Duration::from_millis(SUGGESTION_SETTLE_MS)).await;

        let options: Vec<String> = browser
            .evaluate_json(&suggestion_texts_script())
            .await
            .unwrap_or_default();
        for text in &options {
            scan_addresses(text, exclude, &mut found);
        }
    }

    discard_draft(browser).await;
    found
}

async fn clear_field(browser: &BrowserHandle, selector: &str) -> bool {
    let script = format!(
        r#"
        (() => {{
            const el = document.querySelector('{selector}');
            if (!el) return false;
            el.focus();
            document.execCommand('selectAll', false, null);
            document.execCommand('delete', false, null);
            return true;
        }})()
        "#
    );
    browser.evaluate_bool(&script).await
}

async fn discard_draft(browser: &BrowserHandle) {
    for sel in selectors::DISCARD_DRAFT {
        if browser.click_selector(sel, 600).await {
            return;
        }
    }
    browser.press_key("Escape", 400).await;
}

fn suggestion_texts_script() -> String {
    format!(
        r#"
        (() => {{
            const out = [];
            const sels = {option_sels};
            for (const s of sels) {{
                for (const el of document.querySelectorAll(s)) {{
                    const label = el.getAttribute('aria-label');
                    if (label) out.push(label);
                    const t = el.textContent;
                    if (t) out.push(t);
                }}
            }}
            return JSON.stringify(out);
        }})()
        "#,
        option_sels = selectors::js_array(selectors::SUGGESTION_OPTIONS),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> BTreeSet<String> {
        let exclude = ExclusionList::default();
        let mut out = BTreeSet::new();
        scan_addresses(text, &exclude, &mut out);
        out
    }

    #[test]
    fn synthetic_items_dedupe_to_two() {
        let exclude = ExclusionList::default();
        let mut out = BTreeSet::new();
        for text in ["From: a@x.com", "From: a@x.com", "From: b@x.com"] {
            scan_addresses(text, &exclude, &mut out);
        }
        assert_eq!(out.len(), 2);
        assert!(out.contains("a@x.com"));
        assert!(out.contains("b@x.com"));
    }

    #[test]
    fn rescanning_the_same_text_is_idempotent() {
        let exclude = ExclusionList::default();
        let mut out = BTreeSet::new();
        let text = "Reply to carol@corp.io and dave@corp.io";
        scan_addresses(text, &exclude, &mut out);
        let after_once = out.len();
        scan_addresses(text, &exclude, &mut out);
        assert_eq!(out.len(), after_once);
    }

    #[test]
    fn addresses_are_lowercased() {
        let out = scan("Contact Alice.Smith@Corp.IO today");
        assert!(out.contains("alice.smith@corp.io"));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn implausible_shapes_are_ignored() {
        assert!(scan("not an address: foo@, @bar, plain words").is_empty());
        assert!(scan("missing tld: x@hostname").is_empty());
    }

    #[test]
    fn placeholder_domains_and_noreply_are_excluded() {
        let out = scan("real@corp.io noreply@corp.io bot@example.com sub@mail.example.com");
        assert_eq!(out.len(), 1);
        assert!(out.contains("real@corp.io"));
    }

    #[test]
    fn config_exclusions_extend_defaults() {
        let cfg = Config {
            excluded_domains: vec!["Internal.Test".into()],
            excluded_local_parts: vec!["alerts".into()],
            ..Config::default()
        };
        let exclude = ExclusionList::from_config(&cfg);
        let mut out = BTreeSet::new();
        scan_addresses(
            "keep@corp.io drop@internal.test alerts@corp.io",
            &exclude,
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert!(out.contains("keep@corp.io"));
    }

    #[test]
    fn address_embedded_in_ui_text_is_found() {
        let out = scan("Sent to \u{201c}Bob Jones <bob.jones+cal@dept.corp.example>\u{201d} yesterday");
        assert!(out.contains("bob.jones+cal@dept.corp.example"));
    }
}
