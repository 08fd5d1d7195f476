use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::browser::BrowserHandle;

/// The identity-provider variants the login step knows how to drive.
///
/// Derived from live page state on every attempt, never stored: a redirect
/// chain can move between providers within a single login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    MicrosoftLogin,
    Adfs,
    Okta,
    OneLogin,
    GenericSaml,
    Unknown,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::MicrosoftLogin => "microsoft_login",
            ProviderKind::Adfs => "adfs",
            ProviderKind::Okta => "okta",
            ProviderKind::OneLogin => "onelogin",
            ProviderKind::GenericSaml => "generic_saml",
            ProviderKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the current page.
///
/// URL evidence outranks content evidence: a redirect can land on a
/// transitional page whose content hasn't finished rendering, but the URL
/// is already the destination's. Title/body keywords come second, then a
/// same-domain fallback to the primary provider, else `Unknown`.
pub fn detect(url: &str, title: &str, body: &str) -> ProviderKind {
    let url = url.to_lowercase();

    if url.contains("login.microsoftonline.com")
        || url.contains("login.live.com")
        || url.contains("login.windows.net")
    {
        return ProviderKind::MicrosoftLogin;
    }
    if url.contains(".okta.com") || url.contains(".oktapreview.com") {
        return ProviderKind::Okta;
    }
    if url.contains(".onelogin.com") {
        return ProviderKind::OneLogin;
    }
    let host = host_of(&url);
    if url.contains("/adfs/") || host.starts_with("adfs.") || host.starts_with("sts.") {
        return ProviderKind::Adfs;
    }
    if url.contains("samlrequest") || (url.contains("/saml") && url.contains("sso")) {
        return ProviderKind::GenericSaml;
    }

    let text = format!("{} {}", title.to_lowercase(), body.to_lowercase());
    if text.contains("okta") {
        return ProviderKind::Okta;
    }
    if text.contains("onelogin") {
        return ProviderKind::OneLogin;
    }
    if text.contains("active directory federation") || text.contains("ad fs") {
        return ProviderKind::Adfs;
    }
    if text.contains("saml") && text.contains("single sign-on") {
        return ProviderKind::GenericSaml;
    }
    if text.contains("microsoft") && text.contains("sign in") {
        return ProviderKind::MicrosoftLogin;
    }

    // same-domain fallback: still on the portal's own estate
    if host.ends_with("office.com")
        || host.ends_with("office365.com")
        || host.ends_with("outlook.com")
        || host.ends_with("microsoft.com")
    {
        return ProviderKind::MicrosoftLogin;
    }

    ProviderKind::Unknown
}

fn host_of(url: &str) -> &str {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

/// Read URL, title and a body-text sample off the live page and classify.
/// Never fails: any evaluation error reads as `Unknown`.
pub async fn detect_on_page(browser: &BrowserHandle) -> ProviderKind {
    let url = browser.current_url().await.unwrap_or_default();
    let title = browser
        .evaluate_string("document.title")
        .await
        .unwrap_or_default();
    let body = browser
        .evaluate_string("document.body ? document.body.innerText.slice(0, 4000) : ''")
        .await
        .unwrap_or_default();
    let kind = detect(&url, &title, &body);
    debug!(%url, %kind, "provider classified");
    kind
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_match_beats_page_text() {
        // page text screams Okta, URL says Microsoft; URL wins
        let kind = detect(
            "https://login.microsoftonline.com/common/oauth2/authorize?x=1",
            "Okta",
            "okta okta okta",
        );
        assert_eq!(kind, ProviderKind::MicrosoftLogin);
    }

    #[test]
    fn okta_tenant_url() {
        let kind = detect("https://acme.okta.com/login/login.htm", "", "");
        assert_eq!(kind, ProviderKind::Okta);
    }

    #[test]
    fn adfs_path_and_host() {
        assert_eq!(
            detect("https://fs.corp.example/adfs/ls/?wa=wsignin1.0", "", ""),
            ProviderKind::Adfs
        );
        assert_eq!(
            detect("https://sts.corp.example/login", "", ""),
            ProviderKind::Adfs
        );
    }

    #[test]
    fn content_keywords_when_url_is_neutral() {
        let kind = detect(
            "https://id.corp.example/signin",
            "Acme - Okta",
            "Sign in with your Okta account",
        );
        assert_eq!(kind, ProviderKind::Okta);
    }

    #[test]
    fn same_domain_falls_back_to_primary() {
        let kind = detect("https://outlook.office.com/mail/", "", "");
        assert_eq!(kind, ProviderKind::MicrosoftLogin);
    }

    #[test]
    fn unknown_when_nothing_matches() {
        let kind = detect("https://idp.corp.example/login", "Sign in", "Welcome");
        assert_eq!(kind, ProviderKind::Unknown);
    }

    #[test]
    fn generic_saml_from_url() {
        let kind = detect(
            "https://idp.corp.example/sso/saml2/authn?SAMLRequest=abc",
            "",
            "",
        );
        assert_eq!(kind, ProviderKind::GenericSaml);
    }
}
