//! PII masking for log output
//!
//! Addresses and links never reach the logs verbatim: two characters of the
//! local part and of the first domain label survive, and URL queries (where
//! the tokens live) are replaced wholesale.

use url::Url;

/// `alice@example.com` → `al***@ex***.com`.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => format!("{}@{}", mask_part(local), mask_domain(domain)),
        None => mask_part(email),
    }
}

fn mask_part(part: &str) -> String {
    let kept: String = part.chars().take(2).collect();
    format!("{kept}***")
}

fn mask_domain(domain: &str) -> String {
    match domain.split_once('.') {
        Some((first, rest)) => format!("{}.{rest}", mask_part(first)),
        None => mask_part(domain),
    }
}

/// Reduce a URL to scheme, host and path; any query becomes the literal
/// `?***`. Unparseable input is fully masked.
pub fn redact_url(raw: &str) -> String {
    let Ok(url) = Url::parse(raw) else {
        return "***".to_string();
    };
    let host = url.host_str().unwrap_or_default();
    let suffix = if url.query().is_some() { "?***" } else { "" };
    format!("{}://{}{}{}", url.scheme(), host, url.path(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_local_part_and_domain() {
        assert_eq!(mask_email("alice@example.com"), "al***@ex***.com");
        assert_eq!(mask_email("bob@mail.internal.test"), "bo***@ma***.internal.test");
    }

    #[test]
    fn short_locals_do_not_leak_more_than_they_have() {
        assert_eq!(mask_email("a@example.com"), "a***@ex***.com");
    }

    #[test]
    fn handles_missing_at_sign() {
        assert_eq!(mask_email("not-an-email"), "no***");
    }

    #[test]
    fn handles_single_label_domain() {
        assert_eq!(mask_email("x@localhost"), "x***@lo***");
    }

    #[test]
    fn strips_query_strings() {
        assert_eq!(redact_url("https://app.test/v?t=secret-token"), "https://app.test/v?***");
        assert_eq!(redact_url("https://app.test/reset/path"), "https://app.test/reset/path");
    }

    #[test]
    fn drops_fragments_and_credentials() {
        assert_eq!(redact_url("https://user:pw@app.test/v#frag"), "https://app.test/v");
    }

    #[test]
    fn unparseable_urls_are_fully_masked() {
        assert_eq!(redact_url("::not a url::"), "***");
    }
}
