//! The incremental scroll-and-extract loop over a virtualized message list.
//!
//! The host UI renders list rows lazily and reflows them unpredictably, so
//! the harvester alternates between two states: `Scanning` (process every
//! rendered-but-unprocessed row) and `Scrolling` (fire several independent
//! render triggers, then re-measure). A pass ends in `Exhausted` once a run
//! of scroll attempts advances neither the rendered-item count nor the
//! harvested-address set.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::browser::BrowserHandle;
use crate::extract::{ConversationExtractor, ExclusionList, scan_addresses};
use crate::selectors;

/// Consecutive no-progress scroll attempts tolerated before a folder pass
/// is declared exhausted. In a large mailbox the virtualization can need
/// many nudges before it renders another batch.
pub const EMPTY_BATCH_CEILING: u32 = 25;

const LIST_WAIT: Duration = Duration::from_secs(15);
const SCROLL_SETTLE_MS: u64 = 900;
const FOLDER_NAV_SETTLE_MS: u64 = 2_000;

pub const UNKNOWN_FIELD: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Inbox,
    Sent,
}

impl Folder {
    pub fn url_segment(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sentitems",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sent",
        }
    }
}

impl std::fmt::Display for Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort per-row scrape. Any field may hold the `"unknown"` sentinel;
/// a missing field is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedMessage {
    pub id: String,
    pub folder: String,
    pub index: usize,
    pub sender: String,
    pub subject: String,
    pub preview: String,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

/// Raw row fields as the in-page script reports them.
#[derive(Debug, Deserialize)]
struct RawRow {
    index: usize,
    #[serde(default)]
    id: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    preview: String,
    #[serde(default)]
    date: String,
}

/// Progress bookkeeping for one folder pass.
///
/// The processed cursor is monotone: the host UI only ever appends rendered
/// rows during a pass, never removes them.
#[derive(Debug)]
pub struct QuiescenceTracker {
    processed: usize,
    empty_batches: u32,
    ceiling: u32,
}

impl QuiescenceTracker {
    pub fn new(ceiling: u32) -> Self {
        Self {
            processed: 0,
            empty_batches: 0,
            ceiling,
        }
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Advance the cursor to `rendered`. Never moves backwards.
    pub fn mark_processed(&mut self, rendered: usize) {
        if rendered > self.processed {
            self.processed = rendered;
        }
    }

    /// Record the outcome of one scroll attempt. Progress on either axis
    /// (new rows rendered, new addresses found) resets the empty-batch run.
    pub fn record_pass(&mut self, new_items: bool, new_addresses: bool) {
        if new_items || new_addresses {
            self.empty_batches = 0;
        } else {
            self.empty_batches += 1;
        }
    }

    pub fn exhausted(&self) -> bool {
        self.empty_batches >= self.ceiling
    }
}

/// Outcome of one folder pass. A dead-end at pass start (list never
/// appeared) is reported as a warning with an empty set, never as a hard
/// failure of the parent multi-folder scan.
#[derive(Debug)]
pub struct FolderOutcome {
    pub folder: Folder,
    pub addresses: BTreeSet<String>,
    pub messages: Vec<ExtractedMessage>,
    pub warning: Option<String>,
}

pub struct ListHarvester<'a> {
    browser: &'a BrowserHandle,
    exclude: &'a ExclusionList,
    max_messages: usize,
}

impl<'a> ListHarvester<'a> {
    pub fn new(browser: &'a BrowserHandle, exclude: &'a ExclusionList, max_messages: usize) -> Self {
        Self {
            browser,
            exclude,
            max_messages,
        }
    }

    pub async fn harvest_folder(&self, folder: Folder) -> FolderOutcome {
        let mut outcome = FolderOutcome {
            folder,
            addresses: BTreeSet::new(),
            messages: Vec::new(),
            warning: None,
        };

        if !self.navigate_to_folder(folder).await {
            outcome.warning = Some(format!("could not navigate to {folder}"));
            return outcome;
        }
        if self
            .browser
            .wait_for_any(selectors::LIST_CONTAINERS, LIST_WAIT)
            .await
            .is_none()
        {
            outcome.warning = Some(format!("message list never appeared in {folder}"));
            return outcome;
        }

        let mut tracker = QuiescenceTracker::new(EMPTY_BATCH_CEILING);
        loop {
            let rendered = self.rendered_count().await;
            let addresses_before = outcome.addresses.len();

            if rendered > tracker.processed() {
                self.scan_range(folder, tracker.processed(), rendered, &mut outcome)
                    .await;
                tracker.mark_processed(rendered);
            }
            if outcome.messages.len() >= self.max_messages {
                info!(%folder, limit = self.max_messages, "message limit reached");
                break;
            }

            let new_addresses = outcome.addresses.len() > addresses_before;
            self.scroll_step().await;
            let after = self.rendered_count().await;
            tracker.record_pass(after > rendered, new_addresses);
            if tracker.exhausted() {
                debug!(%folder, processed = tracker.processed(), "list exhausted");
                break;
            }
        }

        info!(
            %folder,
            messages = outcome.messages.len(),
            addresses = outcome.addresses.len(),
            "folder pass complete"
        );
        outcome
    }

    /// Process rows `[from, to)`: scrape the rendered row itself, then open
    /// the conversation for the deep extraction. A single item failing is
    /// logged and skipped; the pass continues.
    async fn scan_range(
        &self,
        folder: Folder,
        from: usize,
        to: usize,
        outcome: &mut FolderOutcome,
    ) {
        let to = to.min(from + self.max_messages.saturating_sub(outcome.messages.len()));
        let rows = self.scrape_rows(from, to).await;
        let extractor = ConversationExtractor::new(self.browser, self.exclude);

        for row in rows {
            // the rendered row already carries addresses in titles/labels
            for text in [&row.sender, &row.subject, &row.preview] {
                scan_addresses(text, self.exclude, &mut outcome.addresses);
            }
            outcome.messages.push(to_message(folder, &row));

            match extractor.extract(row.index).await {
                Some(found) => {
                    outcome.addresses.extend(found);
                }
                None => debug!(%folder, index = row.index, "item yielded nothing"),
            }

            // the list must be confirmed visible before the next item;
            // escalation order: back control, Escape, full reload
            if !extractor.restore().await {
                self.browser.press_key("Escape", 500).await;
                if self
                    .browser
                    .wait_for_any(selectors::LIST_CONTAINERS, Duration::from_secs(3))
                    .await
                    .is_none()
                {
                    warn!(%folder, index = row.index, "list lost, reloading folder");
                    self.reload_folder(folder).await;
                }
            }
        }
    }

    async fn scrape_rows(&self, from: usize, to: usize) -> Vec<RawRow> {
        let script = format!(
            r#"
            (() => {{
                const sels = {item_sels};
                let items = [];
                for (const s of sels) {{
                    const found = document.querySelectorAll(s);
                    if (found.length) {{ items = Array.from(found); break; }}
                }}
                const out = [];
                const end = Math.min({to}, items.length);
                for (let i = {from}; i < end; i++) {{
                    const item = items[i];
                    const row = {{ index: i, id: '', sender: '', subject: '', preview: '', date: '' }};
                    row.id = item.getAttribute('data-convid') || '';
                    const senderEl = item.querySelector('span[title*="@"]');
                    if (senderEl) {{
                        row.sender = (senderEl.getAttribute('title') || senderEl.textContent || '').trim();
                    }}
                    for (const span of item.querySelectorAll('span[title]')) {{
                        const title = span.getAttribute('title') || '';
                        const text = (span.textContent || '').trim();
                        if (!text || title.includes('@')) continue;
                        if (/^\d{{1,2}}:\d{{2}}/.test(text)) {{
                            if (!row.date) row.date = text;
                            continue;
                        }}
                        if (!row.subject) row.subject = title || text;
                    }}
                    for (const span of item.querySelectorAll('span')) {{
                        const text = (span.textContent || '').trim();
                        if (text.length > 50 && text !== row.subject) {{
                            row.preview = text;
                            break;
                        }}
                    }}
                    out.push(row);
                }}
                return JSON.stringify(out);
            }})()
            "#,
            item_sels = selectors::js_array(selectors::LIST_ITEMS),
        );
        self.browser.evaluate_json(&script).await.unwrap_or_default()
    }

    async fn rendered_count(&self) -> usize {
        let script = format!(
            r#"
            (() => {{
                const sels = {item_sels};
                for (const s of sels) {{
                    const n = document.querySelectorAll(s).length;
                    if (n) return JSON.stringify(n);
                }}
                return JSON.stringify(0);
            }})()
            "#,
            item_sels = selectors::js_array(selectors::LIST_ITEMS),
        );
        self.browser.evaluate_json(&script).await.unwrap_or(0)
    }

    /// One scroll attempt. The virtualization reacts to different signals
    /// on different builds of the UI, so several independent triggers fire
    /// each pass, with a single combined settle and one re-measure by the
    /// caller afterwards.
    async fn scroll_step(&self) {
        let script = format!(
            r#"
            (() => {{
                const sels = {container_sels};
                for (const s of sels) {{
                    const el = document.querySelector(s);
                    if (el) {{ el.scrollTop = el.scrollHeight; break; }}
                }}
                window.scrollTo(0, document.body.scrollHeight);
                return true;
            }})()
            "#,
            container_sels = selectors::js_array(selectors::LIST_CONTAINERS),
        );
        self.browser.evaluate_bool(&script).await;
        self.browser.press_key("End", 150).await;
        for _ in 0..3 {
            self.browser.press_key("PageDown", 150).await;
        }
        tokio::time::sleep(Duration::from_millis(SCROLL_SETTLE_MS)).await;
    }

    /// Rewrite the mailbox URL in place to switch folders, staying inside
    /// the already-authenticated app shell.
    async fn navigate_to_folder(&self, folder: Folder) -> bool {
        let script = format!(
            r#"
            (() => {{
                const url = window.location.href;
                if (url.includes('/{segment}')) return 'already';
                const match = url.match(/(https:\/\/outlook\.[^\/]+\/mail\/(?:\d+\/)?)/);
                if (match) {{
                    window.location.href = match[1] + '{segment}';
                    return 'navigating';
                }}
                return 'failed';
            }})()
            "#,
            segment = folder.url_segment(),
        );
        match self.browser.evaluate_string(&script).await.as_deref() {
            Some("already") => true,
            Some("navigating") => {
                tokio::time::sleep(Duration::from_millis(FOLDER_NAV_SETTLE_MS)).await;
                true
            }
            _ => false,
        }
    }

    async fn reload_folder(&self, folder: Folder) {
        if let Some(url) = self.browser.current_url().await {
            self.browser.navigate(&url).await;
        }
        self.navigate_to_folder(folder).await;
        self.browser
            .wait_for_any(selectors::LIST_CONTAINERS, LIST_WAIT)
            .await;
    }
}

fn to_message(folder: Folder, row: &RawRow) -> ExtractedMessage {
    let or_unknown = |s: &str| {
        if s.trim().is_empty() {
            UNKNOWN_FIELD.to_string()
        } else {
            s.trim().to_string()
        }
    };
    // in the sent folder the visible counterparty is the recipient
    let recipient = match folder {
        Folder::Sent if !row.sender.trim().is_empty() => Some(row.sender.trim().to_string()),
        _ => None,
    };
    ExtractedMessage {
        id: or_unknown(&row.id),
        folder: folder.as_str().to_string(),
        index: row.index,
        sender: or_unknown(&row.sender),
        subject: or_unknown(&row.subject),
        preview: or_unknown(&row.preview),
        date: or_unknown(&row.date),
        recipient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_count_is_monotone() {
        let mut tracker = QuiescenceTracker::new(EMPTY_BATCH_CEILING);
        tracker.mark_processed(5);
        assert_eq!(tracker.processed(), 5);
        tracker.mark_processed(3);
        assert_eq!(tracker.processed(), 5);
        tracker.mark_processed(9);
        assert_eq!(tracker.processed(), 9);
    }

    #[test]
    fn quiescent_list_terminates_after_exactly_the_ceiling() {
        let mut tracker = QuiescenceTracker::new(EMPTY_BATCH_CEILING);
        for attempt in 1..=EMPTY_BATCH_CEILING {
            assert!(!tracker.exhausted(), "exhausted early at attempt {attempt}");
            tracker.record_pass(false, false);
        }
        assert!(tracker.exhausted());
    }

    #[test]
    fn progress_on_either_axis_resets_the_run() {
        let mut tracker = QuiescenceTracker::new(3);
        tracker.record_pass(false, false);
        tracker.record_pass(false, false);
        tracker.record_pass(true, false);
        assert!(!tracker.exhausted());
        tracker.record_pass(false, false);
        tracker.record_pass(false, false);
        tracker.record_pass(false, true);
        assert!(!tracker.exhausted());
        tracker.record_pass(false, false);
        tracker.record_pass(false, false);
        tracker.record_pass(false, false);
        assert!(tracker.exhausted());
    }

    #[test]
    fn folder_url_segments() {
        assert_eq!(Folder::Inbox.url_segment(), "inbox");
        assert_eq!(Folder::Sent.url_segment(), "sentitems");
    }

    #[test]
    fn folder_deserializes_from_lowercase() {
        let folders: Vec<Folder> = serde_json::from_str(r#"["inbox","sent"]"#).expect("parse");
        assert_eq!(folders, vec![Folder::Inbox, Folder::Sent]);
    }

    #[test]
    fn empty_row_fields_become_unknown_sentinels() {
        let row = RawRow {
            index: 4,
            id: String::new(),
            sender: "  ".into(),
            subject: "Quarterly review".into(),
            preview: String::new(),
            date: String::new(),
        };
        let msg = to_message(Folder::Inbox, &row);
        assert_eq!(msg.id, UNKNOWN_FIELD);
        assert_eq!(msg.sender, UNKNOWN_FIELD);
        assert_eq!(msg.subject, "Quarterly review");
        assert_eq!(msg.preview, UNKNOWN_FIELD);
        assert_eq!(msg.index, 4);
        assert!(msg.recipient.is_none());
    }

    #[test]
    fn sent_folder_counterparty_is_the_recipient() {
        let row = RawRow {
            index: 0,
            id: "abc".into(),
            sender: "Dana Ops <dana@corp.io>".into(),
            subject: String::new(),
            preview: String::new(),
            date: String::new(),
        };
        let msg = to_message(Folder::Sent, &row);
        assert_eq!(msg.recipient.as_deref(), Some("Dana Ops <dana@corp.io>"));
        assert_eq!(msg.folder, "sent");
    }
}
