//! Provider login: locate the password field, submit the credential,
//! confirm the outcome, and clear the post-login interstitial.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::browser::BrowserHandle;
use crate::error::AutomationError;
use crate::provider::{self, ProviderKind};
use crate::selectors::{self, FieldSelectors};

const FIELD_WAIT: Duration = Duration::from_secs(10);
const FOCUS_SETTLE_MS: u64 = 200;
const SUBMIT_SETTLE_MS: u64 = 3_000;
const PROMPT_SETTLE_MS: u64 = 2_000;
const MAILBOX_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Serialize)]
pub struct LoginOutcome {
    pub success: bool,
    pub provider: ProviderKind,
    pub detail: String,
}

/// Drives the credential step against whichever provider the portal
/// redirected to. Boolean contract throughout: internal errors are caught
/// at this boundary and read as `false`, never as panics or propagated
/// failures.
pub struct CredentialSubmitter<'a> {
    browser: &'a BrowserHandle,
}

impl<'a> CredentialSubmitter<'a> {
    pub fn new(browser: &'a BrowserHandle) -> Self {
        Self { browser }
    }

    /// Enter the account name on the portal's entry page and advance to
    /// the provider redirect.
    pub async fn submit_username(&self, email: &str) -> bool {
        let Some(field) = self
            .browser
            .wait_for_any(selectors::USERNAME_FIELDS, FIELD_WAIT)
            .await
        else {
            warn!("no username field matched on the entry page");
            return false;
        };
        if !self.browser.click_selector(field, FOCUS_SETTLE_MS).await {
            return false;
        }
        if !self.browser.type_text(email).await {
            return false;
        }
        let mut advanced = false;
        for sel in selectors::NEXT_BUTTONS {
            if self.browser.click_selector(sel, 0).await {
                advanced = true;
                break;
            }
        }
        if !advanced {
            self.browser.press_key("Enter", 0).await;
        }
        tokio::time::sleep(Duration::from_millis(SUBMIT_SETTLE_MS)).await;
        true
    }

    /// Submit `password` using the strategy for `provider`.
    ///
    /// Only the primary provider's strategy verifies the resulting page
    /// for error indicators; every other strategy reports optimistic
    /// success once the click lands (a known, documented asymmetry).
    ///
    /// Boolean boundary: the typed faults raised internally are caught
    /// here and read as `false`.
    pub async fn submit_password(&self, provider: ProviderKind, password: &str) -> bool {
        match self.try_submit_password(provider, password).await {
            Ok(accepted) => accepted,
            Err(fault) => {
                warn!(%provider, "{fault}");
                false
            }
        }
    }

    async fn try_submit_password(
        &self,
        provider: ProviderKind,
        password: &str,
    ) -> Result<bool, AutomationError> {
        let fields = selectors::for_provider(provider);

        let Some(password_sel) = self.browser.wait_for_any(fields.password, FIELD_WAIT).await
        else {
            return Err(AutomationError::FieldNotFound {
                role: "password",
                provider: provider.to_string(),
            });
        };
        if !self
            .browser
            .click_selector(password_sel, FOCUS_SETTLE_MS)
            .await
            || !self.browser.type_text(password).await
        {
            return Err(AutomationError::Submit {
                provider: provider.to_string(),
            });
        }

        let mut clicked = false;
        for sel in fields.submit {
            if self.browser.click_selector(sel, 0).await {
                clicked = true;
                break;
            }
        }
        if !clicked {
            debug!(%provider, "no submit control matched, pressing Enter");
            self.browser.press_key("Enter", 0).await;
        }
        tokio::time::sleep(Duration::from_millis(SUBMIT_SETTLE_MS)).await;

        if provider == ProviderKind::MicrosoftLogin && self.error_displayed(fields).await {
            info!(%provider, "provider rejected the credential");
            return Ok(false);
        }
        Ok(true)
    }

    /// Scan the known error containers and body-text patterns for a
    /// rejected-credential indication.
    async fn error_displayed(&self, fields: &FieldSelectors) -> bool {
        for sel in fields.error_selectors {
            let script = format!(
                r#"
                (() => {{
                    const el = document.querySelector('{sel}');
                    return !!el && (el.textContent || '').trim().length > 0;
                }})()
                "#
            );
            if self.browser.evaluate_bool(&script).await {
                debug!(selector = sel, "error container populated");
                return true;
            }
        }
        let body = self
            .browser
            .evaluate_string("document.body ? document.body.innerText : ''")
            .await
            .unwrap_or_default();
        error_text_matches(&body, fields.error_texts)
    }
}

/// Whether any known rejection phrase appears in the page text.
pub fn error_text_matches(body: &str, patterns: &[&str]) -> bool {
    let body = body.to_lowercase();
    patterns.iter().any(|p| body.contains(p))
}

/// Dismiss the "stay signed in" interstitial when present. A single
/// detection pass, not a polling loop: the decline control must exist and
/// the body text must corroborate before anything is clicked. Absent means
/// no-op. Returns whether the prompt was dismissed.
pub async fn dismiss_stay_signed_in(browser: &BrowserHandle) -> bool {
    let body = browser
        .evaluate_string("document.body ? document.body.innerText : ''")
        .await
        .unwrap_or_default()
        .to_lowercase();
    let corroborated = selectors::STAY_SIGNED_IN_TEXT
        .iter()
        .any(|t| body.contains(t));
    if !corroborated {
        return false;
    }
    for sel in selectors::STAY_SIGNED_IN_DECLINE {
        if browser.click_selector(sel, PROMPT_SETTLE_MS).await {
            info!("declined stay-signed-in prompt");
            return true;
        }
    }
    false
}

/// The full password-authentication flow: portal → entry page → provider
/// detection → credential submission → interstitial → mailbox.
pub async fn run_login(
    browser: &BrowserHandle,
    portal_url: &str,
    email: &str,
    password: &str,
) -> LoginOutcome {
    if !browser.navigate(portal_url).await {
        return LoginOutcome {
            success: false,
            provider: ProviderKind::Unknown,
            detail: format!("portal unreachable: {portal_url}"),
        };
    }

    // an attached browser may already hold an authenticated tab
    if mailbox_ready(browser, Duration::from_secs(2)).await {
        return LoginOutcome {
            success: true,
            provider: ProviderKind::Unknown,
            detail: "mailbox already open, no login needed".to_string(),
        };
    }

    let submitter = CredentialSubmitter::new(browser);
    if !submitter.submit_username(email).await {
        return LoginOutcome {
            success: false,
            provider: ProviderKind::Unknown,
            detail: "account entry page did not accept the address".to_string(),
        };
    }

    let provider = provider::detect_on_page(browser).await;
    info!(%provider, "identity provider detected");

    if !submitter.submit_password(provider, password).await {
        return LoginOutcome {
            success: false,
            provider,
            detail: "credential submission failed".to_string(),
        };
    }

    dismiss_stay_signed_in(browser).await;

    if mailbox_ready(browser, MAILBOX_WAIT).await {
        LoginOutcome {
            success: true,
            provider,
            detail: "mailbox reached".to_string(),
        }
    } else {
        LoginOutcome {
            success: false,
            provider,
            detail: "credentials submitted but the mailbox did not load".to_string(),
        }
    }
}

async fn mailbox_ready(browser: &BrowserHandle, timeout: Duration) -> bool {
    if let Some(url) = browser.current_url().await {
        if url.contains("/mail") && browser.selector_exists("div[role=\"listbox\"]").await {
            return true;
        }
    }
    browser
        .wait_for_any(selectors::LIST_CONTAINERS, timeout)
        .await
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_provider_error_text_reads_as_rejection() {
        let fields = selectors::for_provider(ProviderKind::MicrosoftLogin);
        let body = "Enter password\nYour account or password is incorrect. If you don't \
                    remember your password, reset it now.";
        assert!(error_text_matches(body, fields.error_texts));
    }

    #[test]
    fn unrelated_text_is_not_a_rejection() {
        let fields = selectors::for_provider(ProviderKind::MicrosoftLogin);
        assert!(!error_text_matches(
            "Welcome back! Loading your inbox...",
            fields.error_texts
        ));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(error_text_matches(
            "PASSWORD IS INCORRECT",
            &["password is incorrect"]
        ));
    }

    #[test]
    fn non_primary_strategies_have_no_text_verification() {
        for kind in [
            ProviderKind::Adfs,
            ProviderKind::Okta,
            ProviderKind::OneLogin,
            ProviderKind::GenericSaml,
        ] {
            let fields = selectors::for_provider(kind);
            assert!(
                !error_text_matches("your account or password is incorrect", fields.error_texts),
                "{kind} unexpectedly verifies error text"
            );
        }
    }
}
