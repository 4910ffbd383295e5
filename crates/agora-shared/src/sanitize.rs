//! Content sanitizer for user-submitted Markdown/LaTeX source.
//!
//! Content is rendered client-side, so the sanitizer must leave code spans,
//! math and `@quote{N}` references intact while still producing text that is
//! safe to embed in an HTML document. Protected spans are swapped for opaque
//! markers before tag stripping so that `<` and `>` inside code or math
//! survive, then swapped back before the final escape.

use std::sync::OnceLock;

use regex::Regex;

/// Private-use code points delimiting placeholder markers. They are removed
/// from the input up front so user text can never forge a marker.
const MARK_OPEN: char = '\u{E000}';
const MARK_CLOSE: char = '\u{E001}';

static FENCED_CODE: OnceLock<Regex> = OnceLock::new();
static INLINE_CODE: OnceLock<Regex> = OnceLock::new();
static LATEX: OnceLock<Regex> = OnceLock::new();
static QUOTE_REF: OnceLock<Regex> = OnceLock::new();
static HTML_TAG: OnceLock<Regex> = OnceLock::new();
static DANGEROUS_SCHEME: OnceLock<Regex> = OnceLock::new();
static DANGEROUS_CALL: OnceLock<Regex> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static sanitizer pattern"))
}

/// Sanitize raw user content. Empty input yields an empty string.
pub fn sanitize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let decoded = decode_entities(raw);
    let mut text: String = decoded
        .chars()
        .filter(|c| *c != MARK_OPEN && *c != MARK_CLOSE)
        .collect();

    let mut stash: Vec<String> = Vec::new();
    for (cell, pattern) in [
        (&FENCED_CODE, r"```[\s\S]*?```"),
        (&INLINE_CODE, r"`[^`]*`"),
        (
            &LATEX,
            r"\$\$[\s\S]*?\$\$|\$[^$]*?\$|\\\([\s\S]*?\\\)|\\\[[\s\S]*?\\\]",
        ),
        (&QUOTE_REF, r"@quote\{\d+\}"),
    ] {
        text = protect(compiled(cell, pattern), &text, &mut stash);
    }

    // A tag opens with a name, `/` or `!` and never spans a marker, so bare
    // comparison operators around a protected span are left alone.
    text = remove_all(
        compiled(&HTML_TAG, "</?[A-Za-z!][^<>\u{E000}\u{E001}]*>"),
        text,
    );
    text = remove_all(
        compiled(
            &DANGEROUS_SCHEME,
            r"(?i)ms-javascript:|ms-script:|javascript:|jscript:|vbscript:|vbs:|data:|blob:|file:|about:|chrome:",
        ),
        text,
    );
    text = remove_all(
        compiled(
            &DANGEROUS_CALL,
            r"(?i)eval\(|expression\(|settimeout\(|setinterval\(|function\(|alert\(|prompt\(|confirm\(",
        ),
        text,
    );

    // Later spans may contain markers of earlier ones, so unwind in reverse.
    for (idx, original) in stash.iter().enumerate().rev() {
        text = text.replace(&marker(idx), original);
    }

    escape_html(&text)
}

fn marker(idx: usize) -> String {
    format!("{MARK_OPEN}{idx}{MARK_CLOSE}")
}

fn protect(re: &Regex, text: &str, stash: &mut Vec<String>) -> String {
    re.replace_all(text, |caps: &regex::Captures<'_>| {
        let key = marker(stash.len());
        stash.push(caps[0].to_string());
        key
    })
    .into_owned()
}

/// Remove every match, repeating until nothing matches so that removals
/// cannot splice a new match together (`javajavascript:script:`).
fn remove_all(re: &Regex, mut text: String) -> String {
    while re.is_match(&text) {
        text = re.replace_all(&text, "").into_owned();
    }
    text
}

/// Escape `& < > " '` for embedding in HTML text or attribute values.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Decode HTML character references in a single pass.
///
/// Handles the named references the escaper produces plus `&apos;` and
/// `&nbsp;`, and decimal/hex numeric references. Unknown or malformed
/// references are left untouched.
pub fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];

        let decoded = tail
            .char_indices()
            .take(12)
            .find(|(_, c)| *c == ';')
            .and_then(|(semi, _)| decode_reference(&tail[1..semi]).map(|c| (c, semi)));

        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_reference(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code).filter(|c| *c != '\0');
    }
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn test_script_tag_removed() {
        let out = sanitize("<script>alert(1)</script>hello");
        assert!(!out.contains("<script"));
        assert!(!out.to_lowercase().contains("alert("));
        assert!(out.contains("hello"));
    }

    #[test]
    fn test_strips_tags_keeps_text() {
        assert_eq!(sanitize("<b>bold</b> and <i>italic</i>"), "bold and italic");
        assert_eq!(sanitize("line<br/>break"), "linebreak");
    }

    #[test]
    fn test_dangerous_schemes_removed() {
        assert_eq!(sanitize("[x](javascript:run)"), "[x](run)");
        assert_eq!(sanitize("JaVaScRiPt:go"), "go");
        assert_eq!(sanitize("javajavascript:script:go"), "go");
        assert_eq!(sanitize("data:text"), "text");
    }

    #[test]
    fn test_code_spans_survive_tag_stripping() {
        let out = sanitize("see `a<b>c` here");
        assert_eq!(out, "see `a&lt;b&gt;c` here");
        assert_eq!(decode_entities(&out), "see `a<b>c` here");
    }

    #[test]
    fn test_fenced_code_is_protected() {
        let raw = "```\n<div>alert(1)</div>\n```";
        let out = sanitize(raw);
        assert_eq!(decode_entities(&out), raw);
    }

    #[test]
    fn test_latex_and_quotes_are_protected() {
        let raw = "math $a<b$ and $$x>y$$ and \\(p<q\\) ref @quote{42}";
        let out = sanitize(raw);
        assert_eq!(decode_entities(&out), raw);
    }

    #[test]
    fn test_nested_protection_unwinds() {
        let raw = "$a `b` c$";
        assert_eq!(sanitize(raw), raw);
    }

    #[test]
    fn test_double_sanitize_preserves_protected_spans() {
        let spans = ["`let x = 1;`", "$x^2$", "$$\\sum_i i$$", "@quote{7}", "```\nfn main() {}\n```"];
        for span in spans {
            let raw = format!("<p>before</p> {span} after");
            let twice = sanitize(&sanitize(&raw));
            assert!(twice.contains(span), "lost {span:?} in {twice:?}");
        }
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = [
            "plain text",
            "a < b && c > d",
            "<<b>script>x",
            "&lt;b&gt;hi",
            "it's \"quoted\"",
            "`code <tag>` and <em>gone</em>",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_comparisons_around_protected_spans() {
        let raw = "if a < b use `x>0` and c > d";
        let out = sanitize(raw);
        assert_eq!(out, "if a &lt; b use `x&gt;0` and c &gt; d");
        assert_eq!(decode_entities(&sanitize(&out)), raw);

        let raw = "x < $y$ > z";
        assert_eq!(sanitize(raw), "x &lt; $y$ &gt; z");
        assert!(sanitize(&sanitize(raw)).contains("$y$"));
    }

    #[test]
    fn test_tag_cannot_swallow_protected_span() {
        let out = sanitize("<a `k` >tail");
        assert!(out.contains("`k`"), "lost code span in {out:?}");
        assert!(out.contains("tail"));
    }

    #[test]
    fn test_forged_markers_are_dropped() {
        let raw = format!("x{MARK_OPEN}0{MARK_CLOSE}y `z`");
        assert_eq!(sanitize(&raw), "x0y `z`");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">'&'</a>"), "&lt;a href=&quot;x&quot;&gt;&#x27;&amp;&#x27;&lt;/a&gt;");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("&lt;p&gt; &amp;amp; &#39; &#x41; &bogus; & alone"), "<p> &amp; ' A &bogus; & alone");
    }
}
