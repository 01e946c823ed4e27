//! Browser fingerprint patching — hide automation signals.
//!
//! Builds the on-load script injected into every new document. The
//! patched values (platform, languages) follow the active identity so
//! the JavaScript-visible surface matches the presented headers.

use crate::identity::Identity;

/// Build the stealth injection script for an identity.
pub fn stealth_script(identity: &Identity) -> String {
    let primary_language = identity
        .accept_language
        .split(',')
        .next()
        .unwrap_or("en-US")
        .trim()
        .to_string();
    let base_language = primary_language
        .split('-')
        .next()
        .unwrap_or("en")
        .to_string();

    format!(
        r#"
(() => {{
    // Hide webdriver flag
    Object.defineProperty(navigator, 'webdriver', {{
        get: () => false,
        configurable: true,
    }});

    // Patch chrome.runtime to look like a real browser
    if (!window.chrome) {{
        window.chrome = {{}};
    }}
    if (!window.chrome.runtime) {{
        window.chrome.runtime = {{
            connect: function() {{}},
            sendMessage: function() {{}},
        }};
    }}

    // Override permissions query to hide "notifications" prompt
    const originalQuery = window.navigator.permissions.query;
    window.navigator.permissions.query = (parameters) =>
        parameters.name === 'notifications'
            ? Promise.resolve({{ state: Notification.permission }})
            : originalQuery(parameters);

    // Patch plugins to appear non-empty
    Object.defineProperty(navigator, 'plugins', {{
        get: () => [1, 2, 3, 4, 5],
        configurable: true,
    }});

    // Match languages and platform to the presented identity
    Object.defineProperty(navigator, 'languages', {{
        get: () => ['{primary}', '{base}'],
        configurable: true,
    }});
    Object.defineProperty(navigator, 'platform', {{
        get: () => '{platform}',
        configurable: true,
    }});
}})();
"#,
        primary = primary_language,
        base = base_language,
        platform = identity.platform,
    )
}
