//! DKIM-Signature header parsing and rendering

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::HashMap;

use super::{Algorithm, Canonicalization, DkimFailure};

const FOLD_WIDTH: usize = 76;

/// A parsed DKIM-Signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimSignature {
    pub version: u8,
    pub algorithm: Algorithm,
    pub header_canon: Canonicalization,
    pub body_canon: Canonicalization,
    pub domain: String,
    pub selector: String,
    /// Agent or user identifier (`i=`)
    pub identity: Option<String>,
    /// Lowercased header names in signing order
    pub signed_headers: Vec<String>,
    pub body_length: Option<u64>,
    pub body_hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub timestamp: Option<u64>,
    pub expiration: Option<u64>,
}

/// Split a `tag=value; ...` list, rejecting duplicate tags
pub(crate) fn parse_tags(input: &str) -> Option<HashMap<String, String>> {
    let mut tags = HashMap::new();
    for part in input.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, value) = part.split_once('=')?;
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() || tags.contains_key(&name) {
            return None;
        }
        tags.insert(name, value.trim().to_string());
    }
    Some(tags)
}

fn tag<'a>(tags: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    tags.get(name).map(|v| v.as_str())
}

fn required<'a>(tags: &'a HashMap<String, String>, name: &str) -> Result<&'a str, DkimFailure> {
    tag(tags, name).ok_or(DkimFailure::Syntax)
}

fn number(tags: &HashMap<String, String>, name: &str) -> Result<Option<u64>, DkimFailure> {
    tag(tags, name)
        .map(|v| v.parse::<u64>().map_err(|_| DkimFailure::Syntax))
        .transpose()
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

impl DkimSignature {
    /// Parse the value of a DKIM-Signature header field
    pub fn parse(value: &str) -> Result<Self, DkimFailure> {
        let tags = parse_tags(value).ok_or(DkimFailure::Syntax)?;

        if required(&tags, "v")? != "1" {
            return Err(DkimFailure::Syntax);
        }

        let algorithm_tag = required(&tags, "a")?;
        let signature = BASE64
            .decode(strip_whitespace(required(&tags, "b")?))
            .map_err(|_| DkimFailure::Syntax)?;
        let body_hash = BASE64
            .decode(strip_whitespace(required(&tags, "bh")?))
            .map_err(|_| DkimFailure::Syntax)?;

        let domain = required(&tags, "d")?.to_ascii_lowercase();
        let selector = required(&tags, "s")?.to_ascii_lowercase();
        if domain.is_empty() || selector.is_empty() {
            return Err(DkimFailure::Syntax);
        }

        let signed_headers: Vec<String> = strip_whitespace(required(&tags, "h")?)
            .split(':')
            .filter(|h| !h.is_empty())
            .map(|h| h.to_ascii_lowercase())
            .collect();
        if !signed_headers.iter().any(|h| h == "from") {
            return Err(DkimFailure::Syntax);
        }

        let (header_canon, body_canon) = match tag(&tags, "c") {
            None => (Canonicalization::Simple, Canonicalization::Simple),
            Some(c) => {
                let mut modes = c.splitn(2, '/');
                let header = modes
                    .next()
                    .and_then(Canonicalization::parse)
                    .ok_or(DkimFailure::Syntax)?;
                let body = match modes.next() {
                    Some(b) => Canonicalization::parse(b).ok_or(DkimFailure::Syntax)?,
                    None => Canonicalization::Simple,
                };
                (header, body)
            }
        };

        let identity = match tag(&tags, "i") {
            Some(i) => {
                let i = i.to_string();
                let i_domain = i
                    .rsplit_once('@')
                    .map(|(_, d)| d.to_ascii_lowercase())
                    .ok_or(DkimFailure::Syntax)?;
                if i_domain != domain && !i_domain.ends_with(&format!(".{}", domain)) {
                    return Err(DkimFailure::Syntax);
                }
                Some(i)
            }
            None => None,
        };

        let body_length = number(&tags, "l")?;
        let timestamp = number(&tags, "t")?;
        let expiration = number(&tags, "x")?;
        if let (Some(t), Some(x)) = (timestamp, expiration) {
            if x < t {
                return Err(DkimFailure::Syntax);
            }
        }

        // Checked last so a malformed header reports syntax first
        let algorithm = Algorithm::parse(algorithm_tag).ok_or(DkimFailure::UnsupportedAlgorithm)?;

        Ok(Self {
            version: 1,
            algorithm,
            header_canon,
            body_canon,
            domain,
            selector,
            identity,
            signed_headers,
            body_length,
            body_hash,
            signature,
            timestamp,
            expiration,
        })
    }

    /// Domain part of `i=`, or `d=` when absent
    pub fn identity_domain(&self) -> &str {
        self.identity
            .as_deref()
            .and_then(|i| i.rsplit_once('@').map(|(_, d)| d))
            .unwrap_or(&self.domain)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration.map_or(false, |x| now > x)
    }

    /// Full folded header field (`DKIM-Signature: ...`), no trailing CRLF
    ///
    /// `b=` is rendered last, so the field with its `b=` value removed is
    /// exactly [`DkimSignature::to_unsigned_header`].
    pub fn to_header(&self) -> String {
        let mut folder = self.render_unsigned();
        folder.push_split(&BASE64.encode(&self.signature));
        folder.finish()
    }

    /// The header as signed: every tag present, `b=` empty
    pub fn to_unsigned_header(&self) -> String {
        self.render_unsigned().finish()
    }

    fn render_unsigned(&self) -> Folder {
        let mut folder = Folder::new("DKIM-Signature:");
        folder.push_tag(&format!("v={}", self.version));
        folder.push_tag(&format!("a={}", self.algorithm.as_str()));
        folder.push_tag(&format!(
            "c={}/{}",
            self.header_canon.as_str(),
            self.body_canon.as_str()
        ));
        folder.push_tag(&format!("d={}", self.domain));
        folder.push_tag(&format!("s={}", self.selector));
        if let Some(i) = &self.identity {
            folder.push_tag(&format!("i={}", i));
        }
        if let Some(t) = self.timestamp {
            folder.push_tag(&format!("t={}", t));
        }
        if let Some(x) = self.expiration {
            folder.push_tag(&format!("x={}", x));
        }
        if let Some(l) = self.body_length {
            folder.push_tag(&format!("l={}", l));
        }

        folder.push_tag("h=");
        for (n, name) in self.signed_headers.iter().enumerate() {
            let piece = if n == 0 {
                name.clone()
            } else {
                format!(":{}", name)
            };
            folder.push_breakable(&piece);
        }
        folder.push(";");

        folder.push_tag(&format!("bh={}", BASE64.encode(&self.body_hash)));
        folder.push_tag("b=");
        folder
    }
}

/// Header folding at `FOLD_WIDTH` columns with CRLF TAB continuations
struct Folder {
    out: String,
    line_len: usize,
    first_tag: bool,
}

impl Folder {
    fn new(start: &str) -> Self {
        Self {
            out: start.to_string(),
            line_len: start.len(),
            first_tag: true,
        }
    }

    fn push(&mut self, s: &str) {
        self.out.push_str(s);
        self.line_len += s.len();
    }

    fn fold(&mut self) {
        self.out.push_str("\r\n\t");
        self.line_len = 1;
    }

    fn push_breakable(&mut self, s: &str) {
        if self.line_len + s.len() > FOLD_WIDTH && self.line_len > 1 {
            self.fold();
        }
        self.push(s);
    }

    /// Tags are separated by `;` and a space or a fold
    fn push_tag(&mut self, tag: &str) {
        if !self.first_tag && !self.out.ends_with(';') {
            self.push(";");
        }
        self.first_tag = false;
        if self.line_len + 1 + tag.len() > FOLD_WIDTH {
            self.fold();
        } else {
            self.push(" ");
        }
        self.push(tag);
    }

    /// Break a long value across as many lines as needed
    fn push_split(&mut self, value: &str) {
        let mut rest = value;
        while !rest.is_empty() {
            if self.line_len >= FOLD_WIDTH {
                self.fold();
            }
            let room = FOLD_WIDTH - self.line_len;
            let take = room.min(rest.len());
            let (head, tail) = rest.split_at(take);
            self.push(head);
            rest = tail;
        }
    }

    fn finish(self) -> String {
        self.out
    }
}

/// Remove the value of the `b=` tag from a raw DKIM-Signature field
///
/// Whitespace inside the value goes with it; everything else, including
/// folding elsewhere in the field, is kept byte for byte.
pub fn strip_signature_value(raw: &[u8]) -> Vec<u8> {
    let colon = match raw.iter().position(|&b| b == b':') {
        Some(c) => c + 1,
        None => return raw.to_vec(),
    };

    let mut out = raw[..colon].to_vec();
    let mut start = colon;
    while start <= raw.len() {
        let end = raw[start..]
            .iter()
            .position(|&b| b == b';')
            .map(|p| p + start)
            .unwrap_or(raw.len());
        let segment = &raw[start..end];

        let eq = segment.iter().position(|&b| b == b'=');
        let is_b = eq.map_or(false, |eq| {
            let name: Vec<u8> = segment[..eq]
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            name == b"b"
        });

        match (is_b, eq) {
            (true, Some(eq)) => out.extend_from_slice(&segment[..=eq]),
            _ => out.extend_from_slice(segment),
        }

        if end < raw.len() {
            out.push(b';');
        }
        start = end + 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "v=1; a=rsa-sha256; c=relaxed/simple; d=example.com; s=mail;\r\n\t t=1700000000; x=1700604800; h=From:To:Subject;\r\n\t bh=47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=;\r\n\t b=dGVzdA==";

    #[test]
    fn test_parse_sample() {
        let sig = DkimSignature::parse(SAMPLE).unwrap();
        assert_eq!(sig.algorithm, Algorithm::RsaSha256);
        assert_eq!(sig.header_canon, Canonicalization::Relaxed);
        assert_eq!(sig.body_canon, Canonicalization::Simple);
        assert_eq!(sig.domain, "example.com");
        assert_eq!(sig.selector, "mail");
        assert_eq!(sig.signed_headers, vec!["from", "to", "subject"]);
        assert_eq!(sig.signature, b"test");
        assert_eq!(sig.expiration, Some(1_700_604_800));
        assert_eq!(sig.identity_domain(), "example.com");
    }

    #[test]
    fn test_parse_rejects_missing_from() {
        let value = SAMPLE.replace("h=From:To:Subject", "h=To:Subject");
        assert_eq!(DkimSignature::parse(&value), Err(DkimFailure::Syntax));
    }

    #[test]
    fn test_parse_rejects_foreign_identity() {
        let value = format!("{}; i=user@evil.example", SAMPLE);
        assert_eq!(DkimSignature::parse(&value), Err(DkimFailure::Syntax));

        let value = format!("{}; i=user@news.example.com", SAMPLE);
        let sig = DkimSignature::parse(&value).unwrap();
        assert_eq!(sig.identity_domain(), "news.example.com");
    }

    #[test]
    fn test_parse_rejects_expiry_before_timestamp() {
        let value = SAMPLE.replace("x=1700604800", "x=1600000000");
        assert_eq!(DkimSignature::parse(&value), Err(DkimFailure::Syntax));
    }

    #[test]
    fn test_parse_rejects_sha1() {
        let value = SAMPLE.replace("rsa-sha256", "rsa-sha1");
        assert_eq!(
            DkimSignature::parse(&value),
            Err(DkimFailure::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn test_parse_rejects_duplicate_tag() {
        let value = format!("{}; d=other.example", SAMPLE);
        assert_eq!(DkimSignature::parse(&value), Err(DkimFailure::Syntax));
    }

    #[test]
    fn test_single_canonicalization_defaults_body_to_simple() {
        let value = SAMPLE.replace("c=relaxed/simple", "c=relaxed");
        let sig = DkimSignature::parse(&value).unwrap();
        assert_eq!(sig.body_canon, Canonicalization::Simple);
    }

    #[test]
    fn test_header_roundtrip_and_folding() {
        let mut sig = DkimSignature::parse(SAMPLE).unwrap();
        sig.signature = vec![7u8; 256];

        let header = sig.to_header();
        assert!(header.starts_with("DKIM-Signature: v=1; a=rsa-sha256;"));
        assert!(header.split("\r\n").all(|line| line.len() <= 78));

        let value = header.trim_start_matches("DKIM-Signature:");
        assert_eq!(DkimSignature::parse(value).unwrap(), sig);
    }

    #[test]
    fn test_stripping_signed_header_gives_unsigned_template() {
        let mut sig = DkimSignature::parse(SAMPLE).unwrap();
        sig.signature = vec![42u8; 128];

        let stripped = strip_signature_value(sig.to_header().as_bytes());
        assert_eq!(stripped, sig.to_unsigned_header().into_bytes());
    }

    #[test]
    fn test_strip_signature_value_keeps_bh() {
        let raw = b"DKIM-Signature: b=abc\r\n def; bh=xyz; d=example.com";
        assert_eq!(
            strip_signature_value(raw),
            b"DKIM-Signature: b=; bh=xyz; d=example.com".to_vec()
        );
    }
}
