//! Scrubbing of the upstream API key from error text.
//!
//! Upstream URLs carry the key as a query parameter, so transport errors
//! (and anything that embeds the failing URL) can leak it. Every error
//! message the workers log goes through [`redact_secret`] first.

const PLACEHOLDER: &str = "[redacted]";

/// Remove every occurrence of `secret` from `message` — both the raw form
/// and its percent-encoded form, since reqwest errors quote encoded URLs.
pub fn redact_secret(message: &str, secret: &str) -> String {
    if secret.is_empty() {
        return message.to_string();
    }
    let mut out = message.replace(secret, PLACEHOLDER);
    let encoded = urlencoding::encode(secret);
    if encoded != secret {
        out = out.replace(encoded.as_ref(), PLACEHOLDER);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_raw_key() {
        let msg = "GET https://host/feed?api_key=s3cr3t failed";
        let out = redact_secret(msg, "s3cr3t");
        assert!(!out.contains("s3cr3t"));
        assert!(out.contains("[redacted]"));
    }

    #[test]
    fn redacts_percent_encoded_key() {
        // A key with characters that percent-encode differently
        let key = "ab/cd+ef";
        let encoded = urlencoding::encode(key).into_owned();
        assert_ne!(encoded, key);

        let msg = format!("url was ?api_key={} and also ?api_key={}", key, encoded);
        let out = redact_secret(&msg, key);
        assert!(!out.contains(key));
        assert!(!out.contains(&encoded));
    }

    #[test]
    fn empty_secret_is_a_no_op() {
        let msg = "nothing to hide";
        assert_eq!(redact_secret(msg, ""), msg);
    }

    #[test]
    fn message_without_key_unchanged() {
        let out = redact_secret("connection refused", "s3cr3t");
        assert_eq!(out, "connection refused");
    }
}
