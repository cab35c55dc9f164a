//! Address helpers shared by the evaluators

use mail_parser::MessageParser;

use crate::dkim::canonicalize::{normalize_line_endings, split_message, Header};
use crate::dns::normalize_name;

/// Every author address, in header order across all `From:` fields
pub fn from_addresses(raw: &[u8]) -> Vec<String> {
    let message = normalize_line_endings(raw);
    let (headers, _) = split_message(&message);
    headers
        .iter()
        .filter(|h| h.is("From"))
        .flat_map(field_addresses)
        .collect()
}

/// Address in the topmost `From:` header
pub fn from_address(raw: &[u8]) -> Option<String> {
    from_addresses(raw).into_iter().next()
}

/// Domain of the topmost `From:` address
pub fn from_domain(raw: &[u8]) -> Option<String> {
    from_address(raw).and_then(|address| domain_of(&address))
}

/// Distinct author domains in order of appearance
///
/// More than one entry means the message names several authors from
/// different domains.
pub fn from_domains(raw: &[u8]) -> Vec<String> {
    let mut domains: Vec<String> = Vec::new();
    for domain in from_addresses(raw).iter().filter_map(|a| domain_of(a)) {
        if !domains.contains(&domain) {
            domains.push(domain);
        }
    }
    domains
}

/// Domain part of `local@domain`
pub fn domain_of(address: &str) -> Option<String> {
    let address = address.trim().trim_start_matches('<').trim_end_matches('>');
    let (_, domain) = address.rsplit_once('@')?;
    let domain = normalize_name(domain);
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Mailboxes of one `From:` field, parsed on its own
fn field_addresses(field: &Header) -> Vec<String> {
    let mut single = field.raw.clone();
    single.extend_from_slice(b"\r\n\r\n");

    let parsed: Vec<String> = MessageParser::default()
        .parse(&single[..])
        .and_then(|message| {
            message.from().map(|from| {
                from.iter()
                    .filter_map(|a| a.address())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
        })
        .unwrap_or_default();

    if parsed.is_empty() {
        scan_address(&field.value_str()).into_iter().collect()
    } else {
        parsed
    }
}

fn scan_address(value: &str) -> Option<String> {
    let address = match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.trim(),
    };
    address.contains('@').then(|| address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_address() {
        let raw = b"To: b@example.org\r\nFrom: \"Alice A.\" <Alice@Mail.Example.com>\r\nSubject: x\r\n\r\nbody\r\n";
        assert_eq!(from_address(raw).as_deref(), Some("Alice@Mail.Example.com"));
        assert_eq!(from_domain(raw).as_deref(), Some("mail.example.com"));
        assert_eq!(from_domains(raw), vec!["mail.example.com"]);
    }

    #[test]
    fn test_missing_from() {
        assert_eq!(from_domain(b"To: b@example.org\r\n\r\nbody\r\n"), None);
        assert!(from_domains(b"To: b@example.org\r\n\r\nbody\r\n").is_empty());
    }

    #[test]
    fn test_multiple_from_headers() {
        let raw = b"From: CEO <ceo@bank.example>\r\nTo: b@example.org\r\nFrom: Alice <alice@example.com>\r\n\r\nbody\r\n";
        assert_eq!(
            from_addresses(raw),
            vec!["ceo@bank.example", "alice@example.com"]
        );
        assert_eq!(from_domain(raw).as_deref(), Some("bank.example"));
        assert_eq!(from_domains(raw), vec!["bank.example", "example.com"]);

        let same = b"From: a@example.com\r\nFrom: b@Example.com\r\n\r\n";
        assert_eq!(from_domains(same), vec!["example.com"]);
    }

    #[test]
    fn test_folded_mailbox_list() {
        let raw = b"From: Alice <alice@example.com>,\r\n Bob <bob@example.net>\r\n\r\nbody\r\n";
        assert_eq!(from_domains(raw), vec!["example.com", "example.net"]);
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("<bounce@Example.COM.>").as_deref(), Some("example.com"));
        assert_eq!(domain_of("no-at-sign"), None);
        assert_eq!(domain_of("user@"), None);
    }

    #[test]
    fn test_scan_fallback() {
        assert_eq!(
            scan_address(" Bob <bob@example.net>").as_deref(),
            Some("bob@example.net")
        );
        assert_eq!(scan_address(" undisclosed"), None);
    }
}
