use anyhow::Result;

use crate::browser::BrowserHandle;
use crate::selectors;

/// Report which of the configured selector candidates match the current
/// page, for selector maintenance when the portal's markup shifts.
pub async fn inspect_page(browser: &BrowserHandle) -> Result<String> {
    let script = format!(
        r#"
        (() => {{
            const report = {{}};
            const probe = (name, sels) => {{
                const hits = [];
                for (const s of sels) {{
                    const n = document.querySelectorAll(s).length;
                    if (n) hits.push({{ selector: s, count: n }});
                }}
                report[name] = hits;
            }};
            probe('username_fields', {username});
            probe('password_fields', {password});
            probe('submit_controls', {submit});
            probe('stay_signed_in', {stay});
            probe('list_containers', {containers});
            probe('list_items', {items});
            probe('reading_pane', {pane});
            probe('compose_buttons', {compose});
            report.url = window.location.href;
            report.title = document.title;
            return JSON.stringify(report, null, 2);
        }})()
        "#,
        username = selectors::js_array(selectors::USERNAME_FIELDS),
        password = selectors::js_array(selectors::MICROSOFT.password),
        submit = selectors::js_array(selectors::MICROSOFT.submit),
        stay = selectors::js_array(selectors::STAY_SIGNED_IN_DECLINE),
        containers = selectors::js_array(selectors::LIST_CONTAINERS),
        items = selectors::js_array(selectors::LIST_ITEMS),
        pane = selectors::js_array(selectors::READING_PANE),
        compose = selectors::js_array(selectors::COMPOSE_BUTTONS),
    );

    browser
        .evaluate_string(&script)
        .await
        .ok_or_else(|| anyhow::anyhow!("inspection script did not run"))
}
