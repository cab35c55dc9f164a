//! Message splitting and canonicalization (RFC 6376 section 3.4)

use sha2::{Digest, Sha256};

use super::Canonicalization;

/// One header field exactly as it appeared, folding included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    /// Field bytes without the terminating CRLF
    pub raw: Vec<u8>,
}

impl Header {
    /// Everything after the first colon
    pub fn value(&self) -> &[u8] {
        match self.raw.iter().position(|&b| b == b':') {
            Some(pos) => &self.raw[pos + 1..],
            None => &[],
        }
    }

    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(self.value()).into_owned()
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Convert bare LF line endings to CRLF
pub fn normalize_line_endings(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + raw.len() / 32);
    let mut prev = 0u8;
    for &b in raw {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// Split a CRLF message into its header fields and body
///
/// A message without a blank line is all headers and an empty body.
pub fn split_message(raw: &[u8]) -> (Vec<Header>, &[u8]) {
    let mut headers: Vec<Header> = Vec::new();
    let mut pos = 0;

    while pos < raw.len() {
        let end = find_crlf(raw, pos).unwrap_or(raw.len());
        let line = &raw[pos..end];
        let next = (end + 2).min(raw.len());

        if line.is_empty() {
            return (headers, &raw[next..]);
        }

        if line[0] == b' ' || line[0] == b'\t' {
            if let Some(last) = headers.last_mut() {
                last.raw.extend_from_slice(b"\r\n");
                last.raw.extend_from_slice(line);
            }
        } else {
            let name_end = line.iter().position(|&b| b == b':').unwrap_or(line.len());
            let name = String::from_utf8_lossy(&line[..name_end]).trim().to_string();
            headers.push(Header {
                name,
                raw: line.to_vec(),
            });
        }
        pos = next;
    }

    (headers, &[])
}

fn find_crlf(raw: &[u8], from: usize) -> Option<usize> {
    raw[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| p + from)
}

fn is_wsp(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Canonical form of one header field, CRLF included
pub fn canonicalize_header(mode: Canonicalization, header: &Header) -> Vec<u8> {
    match mode {
        Canonicalization::Simple => {
            let mut out = header.raw.clone();
            out.extend_from_slice(b"\r\n");
            out
        }
        Canonicalization::Relaxed => {
            let mut out = header.name.to_ascii_lowercase().into_bytes();
            out.push(b':');

            let mut value = Vec::with_capacity(header.value().len());
            let mut in_wsp = false;
            for &b in header.value() {
                if b == b'\r' || b == b'\n' {
                    continue;
                }
                if is_wsp(b) {
                    in_wsp = true;
                } else {
                    if in_wsp && !value.is_empty() {
                        value.push(b' ');
                    }
                    in_wsp = false;
                    value.push(b);
                }
            }

            out.extend_from_slice(&value);
            out.extend_from_slice(b"\r\n");
            out
        }
    }
}

fn relax_line(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut in_wsp = false;
    for &b in line {
        if is_wsp(b) {
            in_wsp = true;
        } else {
            if in_wsp {
                out.push(b' ');
            }
            in_wsp = false;
            out.push(b);
        }
    }
    out
}

/// Canonical body bytes
pub fn canonicalize_body(mode: Canonicalization, body: &[u8]) -> Vec<u8> {
    let mut pieces: Vec<&[u8]> = body.split(|&b| b == b'\n').collect();
    let last = pieces.len() - 1;
    for piece in pieces.iter_mut().take(last) {
        if let Some(stripped) = piece.strip_suffix(b"\r") {
            *piece = stripped;
        }
    }

    let mut lines: Vec<Vec<u8>> = match mode {
        Canonicalization::Simple => pieces.iter().map(|l| l.to_vec()).collect(),
        Canonicalization::Relaxed => pieces.iter().map(|l| relax_line(l)).collect(),
    };

    while lines.last().map_or(false, |l| l.is_empty()) {
        lines.pop();
    }

    if lines.is_empty() {
        return match mode {
            Canonicalization::Simple => b"\r\n".to_vec(),
            Canonicalization::Relaxed => Vec::new(),
        };
    }

    let mut out = Vec::with_capacity(body.len() + 2);
    for line in lines {
        out.extend_from_slice(&line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// SHA-256 over the canonical body, truncated to `limit` bytes
///
/// Returns `None` when `limit` claims more bytes than the body has.
pub fn body_hash(mode: Canonicalization, body: &[u8], limit: Option<u64>) -> Option<Vec<u8>> {
    let canonical = canonicalize_body(mode, body);
    let hashed = match limit {
        Some(l) => {
            let l = usize::try_from(l).ok()?;
            if l > canonical.len() {
                return None;
            }
            &canonical[..l]
        }
        None => &canonical[..],
    };
    Some(Sha256::digest(hashed).to_vec())
}

/// Pick header instances for `h=`, consuming from the bottom up
///
/// Each repeat of a name takes the next instance above the previous one.
/// Names with no instance left contribute nothing.
pub fn select_headers<'a>(headers: &'a [Header], names: &[String]) -> Vec<&'a Header> {
    let mut used = vec![false; headers.len()];
    let mut selected = Vec::with_capacity(names.len());

    for name in names {
        let found = headers
            .iter()
            .enumerate()
            .rev()
            .find(|(i, h)| !used[*i] && h.is(name));
        if let Some((i, header)) = found {
            used[i] = true;
            selected.push(header);
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(raw: &str) -> Header {
        let (headers, _) = split_message(format!("{}\r\n\r\n", raw).as_bytes());
        headers.into_iter().next().unwrap()
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings(b"a\nb\r\nc\n"), b"a\r\nb\r\nc\r\n");
    }

    #[test]
    fn test_split_message() {
        let raw = b"From: a@example.com\r\nSubject: hello\r\n  world\r\n\r\nBody\r\n";
        let (headers, body) = split_message(raw);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].name, "Subject");
        assert_eq!(headers[1].raw, b"Subject: hello\r\n  world");
        assert_eq!(body, b"Body\r\n");
    }

    #[test]
    fn test_split_message_without_body() {
        let (headers, body) = split_message(b"From: a@example.com\r\n");
        assert_eq!(headers.len(), 1);
        assert!(body.is_empty());
    }

    #[test]
    fn test_relaxed_header() {
        let h = header("SUBJect \t:  Hello \r\n\t  big   World  ");
        assert_eq!(
            canonicalize_header(Canonicalization::Relaxed, &h),
            b"subject:Hello big World\r\n"
        );
    }

    #[test]
    fn test_simple_header_is_untouched() {
        let h = header("SUBJect :  Hello \r\n\tWorld");
        assert_eq!(
            canonicalize_header(Canonicalization::Simple, &h),
            b"SUBJect :  Hello \r\n\tWorld\r\n"
        );
    }

    #[test]
    fn test_simple_body() {
        let c = Canonicalization::Simple;
        assert_eq!(canonicalize_body(c, b"Hello  World \r\n\r\n\r\n"), b"Hello  World \r\n");
        assert_eq!(canonicalize_body(c, b""), b"\r\n");
        assert_eq!(canonicalize_body(c, b"\r\n\r\n"), b"\r\n");
        assert_eq!(canonicalize_body(c, b"no newline"), b"no newline\r\n");
    }

    #[test]
    fn test_relaxed_body() {
        let c = Canonicalization::Relaxed;
        assert_eq!(canonicalize_body(c, b" C \r\nD \t E\r\n\r\n\r\n"), b" C\r\nD E\r\n");
        assert_eq!(canonicalize_body(c, b""), b"");
        assert_eq!(canonicalize_body(c, b"  \r\n\r\n"), b"");
    }

    #[test]
    fn test_body_hash_of_empty_simple_body() {
        // RFC 6376 section 3.4.3: hash of a lone CRLF
        let hash = body_hash(Canonicalization::Simple, b"", None).unwrap();
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        assert_eq!(BASE64.encode(hash), "frcCV1k9oG9oKj3dpUqdJg1PxRT2RSN/XKdLCPjaYaY=");
    }

    #[test]
    fn test_body_hash_of_empty_relaxed_body() {
        let hash = body_hash(Canonicalization::Relaxed, b"", None).unwrap();
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        assert_eq!(BASE64.encode(hash), "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
    }

    #[test]
    fn test_body_length_limit() {
        let c = Canonicalization::Simple;
        let full = body_hash(c, b"Hello\r\nWorld\r\n", None).unwrap();
        let limited = body_hash(c, b"Hello\r\nWorld\r\nappended\r\n", Some(14)).unwrap();
        assert_eq!(full, limited);
        assert!(body_hash(c, b"Hi\r\n", Some(100)).is_none());
    }

    #[test]
    fn test_select_headers_bottom_up() {
        let raw = b"Received: one\r\nFrom: a@example.com\r\nReceived: two\r\n\r\n";
        let (headers, _) = split_message(raw);
        let names = vec![
            "received".to_string(),
            "received".to_string(),
            "received".to_string(),
            "from".to_string(),
        ];

        let selected = select_headers(&headers, &names);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0].raw, b"Received: two");
        assert_eq!(selected[1].raw, b"Received: one");
        assert_eq!(selected[2].name, "From");
    }
}
