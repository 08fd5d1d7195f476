//! Selector-candidate tables.
//!
//! The portals this tool drives change their markup constantly, so every
//! lookup the automation performs goes through an ordered candidate list
//! kept here as plain data. First match wins. Logic elsewhere stays generic
//! over these tables; updating a broken selector never touches code.

use crate::provider::ProviderKind;

/// The per-provider lookup bundle for the credential step.
pub struct FieldSelectors {
    pub password: &'static [&'static str],
    pub submit: &'static [&'static str],
    /// Containers that hold a visible error message after a failed submit.
    pub error_selectors: &'static [&'static str],
    /// Lowercase body-text fragments that indicate a rejected credential.
    pub error_texts: &'static [&'static str],
}

pub const MICROSOFT: FieldSelectors = FieldSelectors {
    password: &[
        "input[name=\"passwd\"]",
        "#i0118",
        "input[type=\"password\"][name=\"Password\"]",
        "input[type=\"password\"]",
    ],
    submit: &[
        "#idSIButton9",
        "input[type=\"submit\"][value=\"Sign in\"]",
        "input[type=\"submit\"]",
        "button[type=\"submit\"]",
    ],
    error_selectors: &[
        "#passwordError",
        "#usernameError",
        "#i0118Error",
        "div[role=\"alert\"]",
        ".alert-error",
    ],
    error_texts: &[
        "your account or password is incorrect",
        "password is incorrect",
        "that microsoft account doesn't exist",
        "account doesn't exist",
        "sign-in was blocked",
        "we couldn't sign you in",
    ],
};

pub const ADFS: FieldSelectors = FieldSelectors {
    password: &[
        "#passwordInput",
        "input[name=\"Password\"]",
        "input[type=\"password\"]",
    ],
    submit: &[
        "#submitButton",
        "span#submitButton",
        "input[type=\"submit\"]",
        "button[type=\"submit\"]",
    ],
    error_selectors: &["#errorText", "#error", "div[role=\"alert\"]"],
    error_texts: &[],
};

pub const OKTA: FieldSelectors = FieldSelectors {
    password: &[
        "#okta-signin-password",
        "input[name=\"password\"]",
        "input[name=\"credentials.passcode\"]",
        "input[type=\"password\"]",
    ],
    submit: &[
        "#okta-signin-submit",
        "input[type=\"submit\"][value=\"Verify\"]",
        "input[type=\"submit\"]",
        "button[type=\"submit\"]",
    ],
    error_selectors: &[".okta-form-infobox-error", "div[role=\"alert\"]"],
    error_texts: &[],
};

pub const ONELOGIN: FieldSelectors = FieldSelectors {
    password: &[
        "#password",
        "input[name=\"password\"]",
        "input[type=\"password\"]",
    ],
    submit: &[
        "button[type=\"submit\"]",
        "#login-button",
        "input[type=\"submit\"]",
    ],
    error_selectors: &["#flash", "div[role=\"alert\"]"],
    error_texts: &[],
};

pub const GENERIC_SAML: FieldSelectors = FieldSelectors {
    password: &["input[type=\"password\"]"],
    submit: &[
        "button[type=\"submit\"]",
        "input[type=\"submit\"]",
        "button[name=\"login\"]",
    ],
    error_selectors: &["div[role=\"alert\"]"],
    error_texts: &[],
};

pub fn for_provider(kind: ProviderKind) -> &'static FieldSelectors {
    match kind {
        ProviderKind::MicrosoftLogin => &MICROSOFT,
        ProviderKind::Adfs => &ADFS,
        ProviderKind::Okta => &OKTA,
        ProviderKind::OneLogin => &ONELOGIN,
        // unknown pages get the generic strategy too; a bare password
        // input is the only signal we can count on
        ProviderKind::GenericSaml | ProviderKind::Unknown => &GENERIC_SAML,
    }
}

/// Account-entry page, before the provider redirect.
pub const USERNAME_FIELDS: &[&str] = &[
    "input[name=\"loginfmt\"]",
    "#i0116",
    "input[type=\"email\"]",
    "input[name=\"username\"]",
];

pub const NEXT_BUTTONS: &[&str] = &[
    "#idSIButton9",
    "input[type=\"submit\"]",
    "button[type=\"submit\"]",
];

/// "Stay signed in?" interstitial. The decline control plus corroborating
/// body text must both be present before we click anything.
pub const STAY_SIGNED_IN_DECLINE: &[&str] = &[
    "#idBtn_Back",
    "input[type=\"button\"][value=\"No\"]",
    "#declineButton",
];

pub const STAY_SIGNED_IN_TEXT: &[&str] = &["stay signed in"];

/// Mailbox list view.
pub const LIST_CONTAINERS: &[&str] = &[
    "div[role=\"listbox\"]",
    "div[aria-label=\"Message list\"]",
    "div[aria-label=\"Mail list\"]",
    "[data-app-section=\"MessageList\"]",
];

pub const LIST_ITEMS: &[&str] = &[
    "[data-convid]",
    "div[role=\"listbox\"] [role=\"option\"]",
];

/// Opened-conversation view.
pub const READING_PANE: &[&str] = &[
    "div[role=\"document\"]",
    "[aria-label*=\"Message body\"]",
    "[data-app-section=\"ConversationContainer\"]",
];

/// Collapsed-thread expansion triggers. All of these get clicked when
/// present; none is required for the extraction to proceed.
pub const THREAD_EXPANDERS: &[&str] = &[
    "[aria-label*=\"Expand\"]",
    "button[title*=\"See more\"]",
    "div[role=\"button\"][aria-label*=\"collapsed\"]",
    "[aria-label=\"Open conversation\"]",
];

/// Header regions worth scraping inside an opened conversation.
pub const HEADER_FIELDS: &[&str] = &[
    "span[title*=\"@\"]",
    "div[role=\"heading\"]",
    "[aria-label=\"To\"] span",
    "[aria-label=\"Cc\"] span",
    "button[aria-haspopup=\"dialog\"] span",
];

/// Controls that return from a conversation to the list.
pub const BACK_TO_LIST: &[&str] = &[
    "button[aria-label=\"Back\"]",
    "button[aria-label=\"Close\"]",
    "[aria-label=\"Close message\"]",
];

/// Compose view, for recipient-suggestion scraping.
pub const COMPOSE_BUTTONS: &[&str] = &[
    "button[aria-label=\"New mail\"]",
    "button[aria-label=\"New message\"]",
    "[data-testid=\"splitbuttonprimary\"]",
];

pub const RECIPIENT_FIELDS: &[&str] = &[
    "div[aria-label=\"To\"]",
    "input[aria-label=\"To\"]",
    "div[role=\"textbox\"][aria-label*=\"To\"]",
];

pub const SUGGESTION_OPTIONS: &[&str] = &[
    "div[role=\"listbox\"] [role=\"option\"]",
    "[id^=\"suggestion\"]",
];

pub const DISCARD_DRAFT: &[&str] = &[
    "button[aria-label=\"Discard\"]",
    "button[title=\"Discard\"]",
];

/// Render a candidate list as a JS array literal for injection into an
/// evaluated script.
pub fn js_array(candidates: &[&str]) -> String {
    serde_json::to_string(candidates).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_provider_has_candidates() {
        for kind in [
            ProviderKind::MicrosoftLogin,
            ProviderKind::Adfs,
            ProviderKind::Okta,
            ProviderKind::OneLogin,
            ProviderKind::GenericSaml,
            ProviderKind::Unknown,
        ] {
            let fields = for_provider(kind);
            assert!(!fields.password.is_empty(), "{kind}: empty password list");
            assert!(!fields.submit.is_empty(), "{kind}: empty submit list");
        }
    }

    #[test]
    fn only_primary_provider_verifies_error_text() {
        assert!(!MICROSOFT.error_texts.is_empty());
        assert!(ADFS.error_texts.is_empty());
        assert!(OKTA.error_texts.is_empty());
        assert!(ONELOGIN.error_texts.is_empty());
        assert!(GENERIC_SAML.error_texts.is_empty());
    }

    #[test]
    fn js_array_escapes_quotes() {
        let rendered = js_array(&["input[name=\"passwd\"]", "#i0118"]);
        assert_eq!(rendered, r##"["input[name=\"passwd\"]","#i0118"]"##);
    }
}
