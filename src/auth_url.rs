//! Authenticated remote URLs
//!
//! Tokens ride along in the URL as the password of an HTTP basic-auth
//! principal, the form every git host we talk to accepts:
//!
//! ```text
//! https://x-access-token:{token}@{host}/{owner}/{repo}.git
//! ```

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;
use url::Url;

/// Username placed in front of the token. Hosts ignore it but require one.
pub const TOKEN_USERNAME: &str = "x-access-token";

/// Embed `token` into `remote`. Returns `remote` unchanged without a token.
///
/// URLs the `url` crate refuses to parse, or that are not HTTP(S), fall back to
/// substituting the scheme prefix so a slightly malformed remote still gets a
/// credential instead of an error.
pub fn authenticated_url(remote: &str, token: Option<&str>) -> String {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return remote.to_string();
    };

    if let Ok(mut url) = Url::parse(remote) {
        if matches!(url.scheme(), "http" | "https")
            && url.has_host()
            && url.set_username(TOKEN_USERNAME).is_ok()
            && url.set_password(Some(token)).is_ok()
        {
            return url.to_string();
        }
    }

    for scheme in ["https://", "http://"] {
        if let Some(rest) = remote.strip_prefix(scheme) {
            // Drop any credentials already present before the host.
            let rest = match (rest.find('@'), rest.find('/')) {
                (Some(at), Some(slash)) if at < slash => &rest[at + 1..],
                (Some(at), None) => &rest[at + 1..],
                _ => rest,
            };
            return format!("{scheme}{TOKEN_USERNAME}:{token}@{rest}");
        }
    }

    remote.to_string()
}

/// The `scheme://host[:port]` a remote belongs to, used to key credentials.
///
/// Returns `None` for remotes that never carry a token (local paths, SSH).
pub fn host_origin(remote: &str) -> Option<String> {
    let url = Url::parse(remote).ok()?;
    if !matches!(url.scheme(), "http" | "https") || !url.has_host() {
        return None;
    }
    Some(url.origin().ascii_serialization())
}

/// Replace any `user:password@` credentials inside `text` with `***`.
pub fn redact(text: &str) -> Cow<'_, str> {
    static USERINFO: OnceLock<Option<Regex>> = OnceLock::new();
    let re = USERINFO.get_or_init(|| {
        Regex::new(r"(?P<scheme>[a-zA-Z][a-zA-Z0-9+.-]*://)(?P<user>[^/@\s:']+):[^/@\s']+@").ok()
    });
    match re {
        Some(re) => re.replace_all(text, "${scheme}${user}:***@"),
        None => Cow::Borrowed(text),
    }
}
