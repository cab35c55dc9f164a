//! Macro expansion in SPF domain-specs (RFC 7208 section 7)

use std::net::IpAddr;

use super::SpfError;

const DELIMITERS: &[char] = &['.', '-', '+', ',', '/', '_', '='];
const MAX_DOMAIN_LEN: usize = 253;

/// Values macros expand to during one `check_host` call
#[derive(Debug, Clone)]
pub struct MacroContext<'a> {
    /// `local-part@domain` of the checked identity
    pub sender: &'a str,
    /// Domain currently being evaluated
    pub domain: &'a str,
    pub ip: IpAddr,
    pub helo: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Macro {
        letter: char,
        escape: bool,
        keep: Option<usize>,
        reverse: bool,
        delimiters: Vec<char>,
    },
}

fn tokenize(spec: &str) -> Result<Vec<Token>, SpfError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = spec.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => literal.push('%'),
            Some('_') => literal.push(' '),
            Some('-') => literal.push_str("%20"),
            Some('{') => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => body.push(ch),
                        None => return Err(SpfError::Syntax),
                    }
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(parse_macro(&body)?);
            }
            _ => return Err(SpfError::Syntax),
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn parse_macro(body: &str) -> Result<Token, SpfError> {
    let mut chars = body.chars();
    let letter = chars.next().ok_or(SpfError::Syntax)?;
    let escape = letter.is_ascii_uppercase();
    let letter = letter.to_ascii_lowercase();
    // c, r and t are only meaningful in explanation strings
    if !"slodiphv".contains(letter) {
        return Err(SpfError::Syntax);
    }

    let rest: String = chars.collect();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let mut tail = &rest[digits.len()..];

    let keep = if digits.is_empty() {
        None
    } else {
        match digits.parse::<usize>() {
            Ok(0) | Err(_) => return Err(SpfError::Syntax),
            Ok(n) => Some(n),
        }
    };

    let reverse = tail.starts_with('r') || tail.starts_with('R');
    if reverse {
        tail = &tail[1..];
    }

    let delimiters: Vec<char> = tail.chars().collect();
    if delimiters.iter().any(|d| !DELIMITERS.contains(d)) {
        return Err(SpfError::Syntax);
    }

    Ok(Token::Macro {
        letter,
        escape,
        keep,
        reverse,
        delimiters,
    })
}

/// Check a domain-spec without expanding it
pub fn validate(spec: &str) -> Result<(), SpfError> {
    tokenize(spec).map(|_| ())
}

/// Expand every macro in `spec`
pub fn expand(spec: &str, ctx: &MacroContext<'_>) -> Result<String, SpfError> {
    let mut out = String::new();
    for token in tokenize(spec)? {
        match token {
            Token::Literal(text) => out.push_str(&text),
            Token::Macro {
                letter,
                escape,
                keep,
                reverse,
                delimiters,
            } => {
                let value = letter_value(letter, ctx);
                let value = transform(&value, keep, reverse, &delimiters);
                if escape {
                    out.push_str(&url_escape(&value));
                } else {
                    out.push_str(&value);
                }
            }
        }
    }
    Ok(truncate_domain(&out))
}

fn letter_value(letter: char, ctx: &MacroContext<'_>) -> String {
    let (local, sender_domain) = ctx
        .sender
        .rsplit_once('@')
        .unwrap_or(("postmaster", ctx.sender));

    match letter {
        's' => ctx.sender.to_string(),
        'l' => local.to_string(),
        'o' => sender_domain.to_string(),
        'd' => ctx.domain.to_string(),
        'i' => dotted_ip(ctx.ip),
        // No validated PTR lookup is made for macros
        'p' => "unknown".to_string(),
        'v' => match ctx.ip {
            IpAddr::V4(_) => "in-addr".to_string(),
            IpAddr::V6(_) => "ip6".to_string(),
        },
        'h' => ctx.helo.to_string(),
        _ => String::new(),
    }
}

/// IPv4 in dotted quad, IPv6 as dot-separated nibbles
fn dotted_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .flat_map(|b| [b >> 4, b & 0x0f])
            .map(|n| format!("{:x}", n))
            .collect::<Vec<_>>()
            .join("."),
    }
}

fn transform(value: &str, keep: Option<usize>, reverse: bool, delimiters: &[char]) -> String {
    if keep.is_none() && !reverse && delimiters.is_empty() {
        return value.to_string();
    }

    let split_on: &[char] = if delimiters.is_empty() { &['.'] } else { delimiters };
    let mut parts: Vec<&str> = value.split(|c| split_on.contains(&c)).collect();
    if reverse {
        parts.reverse();
    }
    if let Some(n) = keep {
        if parts.len() > n {
            parts = parts.split_off(parts.len() - n);
        }
    }
    parts.join(".")
}

fn url_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Drop leading labels until the name fits in 253 characters
fn truncate_domain(name: &str) -> String {
    let mut rest = name;
    while rest.len() > MAX_DOMAIN_LEN {
        match rest.split_once('.') {
            Some((_, tail)) => rest = tail,
            None => break,
        }
    }
    rest.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(ip: &str) -> MacroContext<'static> {
        MacroContext {
            sender: "strong-bad@email.example.com",
            domain: "email.example.com",
            ip: ip.parse().unwrap(),
            helo: "mx.example.org",
        }
    }

    #[test]
    fn test_rfc_examples() {
        let c = ctx("192.0.2.3");
        assert_eq!(expand("%{s}", &c).unwrap(), "strong-bad@email.example.com");
        assert_eq!(expand("%{o}", &c).unwrap(), "email.example.com");
        assert_eq!(expand("%{d4}", &c).unwrap(), "email.example.com");
        assert_eq!(expand("%{d3}", &c).unwrap(), "email.example.com");
        assert_eq!(expand("%{d2}", &c).unwrap(), "example.com");
        assert_eq!(expand("%{d1}", &c).unwrap(), "com");
        assert_eq!(expand("%{dr}", &c).unwrap(), "com.example.email");
        assert_eq!(expand("%{d2r}", &c).unwrap(), "example.email");
        assert_eq!(expand("%{l}", &c).unwrap(), "strong-bad");
        assert_eq!(expand("%{l-}", &c).unwrap(), "strong.bad");
        assert_eq!(expand("%{lr-}", &c).unwrap(), "bad.strong");
        assert_eq!(expand("%{l1r-}", &c).unwrap(), "strong");
        assert_eq!(
            expand("%{ir}.%{v}._spf.%{d2}", &c).unwrap(),
            "3.2.0.192.in-addr._spf.example.com"
        );
        assert_eq!(
            expand("%{lr-}.lp._spf.%{d2}", &c).unwrap(),
            "bad.strong.lp._spf.example.com"
        );
    }

    #[test]
    fn test_ipv6_nibbles() {
        let c = ctx("2001:db8::cb01");
        assert_eq!(
            expand("%{ir}.%{v}._spf.%{d2}", &c).unwrap(),
            "1.0.b.c.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6._spf.example.com"
        );
    }

    #[test]
    fn test_escapes_and_other_letters() {
        let c = ctx("192.0.2.3");
        assert_eq!(expand("a%%b%_c%-d", &c).unwrap(), "a%b c%20d");
        assert_eq!(expand("%{p}.%{h}", &c).unwrap(), "unknown.mx.example.org");
        assert_eq!(expand("%{S}", &c).unwrap(), "strong-bad%40email.example.com");
    }

    #[test]
    fn test_invalid_macros() {
        for spec in ["%{x}", "%{d0}", "%{d", "%z", "%{c}", "%{d2q}"] {
            assert_eq!(validate(spec), Err(SpfError::Syntax), "{}", spec);
        }
        assert!(validate("_spf.%{d}").is_ok());
    }

    #[test]
    fn test_long_names_are_truncated_from_the_left() {
        let long = format!("{}.example.com", "a".repeat(63));
        let spec = format!("{0}.{0}.{0}.{0}", long);
        let expanded = expand(&spec, &ctx("192.0.2.3")).unwrap();
        assert!(expanded.len() <= 253);
        assert!(expanded.ends_with("example.com"));
    }
}
