//! Text cleanup for speech synthesis.
//!
//! Model output arrives as markdown; speaking it verbatim reads out
//! asterisks and backticks. [`clean_markdown`] strips both complete and
//! unterminated markdown syntax to plain text, and [`split_sentences`]
//! cuts cleaned text into sentence-sized pieces so synthesis can start
//! before the full response is available.

/// Punctuation that ends a sentence for synthesis purposes. Covers both
/// ASCII and full-width CJK variants.
const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', ';', '。', '！', '？', '；', '\n'];

/// Strips markdown formatting to plain text.
///
/// Handles headings, emphasis, inline code, fenced code blocks (complete
/// or unterminated), links, images, strikethrough, blockquotes, lists,
/// horizontal rules, and HTML tags. Unmatched emphasis markers are
/// dropped rather than kept.
pub fn clean_markdown(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = strip_code_fences(text);

    let mut cleaned_lines: Vec<String> = Vec::new();
    for raw_line in text.lines() {
        let line = strip_line_markers(raw_line.trim());
        if is_horizontal_rule(line) {
            cleaned_lines.push(String::new());
            continue;
        }
        let cleaned = strip_inline(line);
        cleaned_lines.push(cleaned.trim().to_string());
    }

    // Blank lines carry nothing for speech; drop them entirely.
    cleaned_lines
        .iter()
        .filter(|line| !line.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits text into sentences on terminal punctuation, keeping the
/// punctuation with its sentence. The final fragment is returned even
/// without a terminator.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if SENTENCE_ENDINGS.contains(&ch) {
            if ch != '\n' {
                current.push(ch);
            }
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        } else {
            current.push(ch);
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Removes fenced code blocks, including an unterminated trailing fence.
fn strip_code_fences(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            result.push_str(line);
            result.push('\n');
        }
    }
    result
}

/// Strips leading block markers: headings, blockquotes, list bullets,
/// ordered-list numbers.
fn strip_line_markers(line: &str) -> &str {
    let mut line = line;
    loop {
        let trimmed = line.trim_start();
        let next = if let Some(rest) = trimmed.strip_prefix('#') {
            let mut rest = rest;
            while let Some(r) = rest.strip_prefix('#') {
                rest = r;
            }
            rest
        } else if let Some(rest) = trimmed.strip_prefix('>') {
            rest
        } else if let Some(rest) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
            .or_else(|| trimmed.strip_prefix("+ "))
        {
            rest
        } else if let Some(rest) = strip_ordered_marker(trimmed) {
            rest
        } else {
            return trimmed;
        };
        line = next;
    }
}

/// Strips `1. ` / `12. ` style ordered-list markers.
fn strip_ordered_marker(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    line[digits..].strip_prefix('.').map(|r| r.trim_start())
}

fn is_horizontal_rule(line: &str) -> bool {
    line.len() >= 3
        && !line.is_empty()
        && (line.chars().all(|c| c == '-')
            || line.chars().all(|c| c == '*')
            || line.chars().all(|c| c == '_'))
}

/// Strips inline syntax: emphasis markers, inline code, links, images,
/// strikethrough, HTML tags.
fn strip_inline(line: &str) -> String {
    let mut result = String::with_capacity(line.len());
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            // Image: drop the bang, fall through to link handling.
            '!' if chars.get(i + 1) == Some(&'[') => {
                i += 1;
            }
            // Link: keep the label, drop the URL.
            '[' => {
                if let Some((label, rest)) = parse_link(&chars[i..]) {
                    result.push_str(&label);
                    i += rest;
                } else {
                    result.push('[');
                    i += 1;
                }
            }
            // HTML tag: drop through the closing angle bracket.
            '<' => {
                if let Some(end) = chars[i..].iter().position(|&c| c == '>') {
                    i += end + 1;
                } else {
                    result.push('<');
                    i += 1;
                }
            }
            // Emphasis, code, strikethrough markers: dropped whether or
            // not their pair is present.
            '*' | '`' | '~' => {
                i += 1;
            }
            '_' => {
                // Underscores inside a word (snake_case) are kept.
                let prev_alnum = i > 0 && chars[i - 1].is_alphanumeric();
                let next_alnum = chars.get(i + 1).is_some_and(|c| c.is_alphanumeric());
                if prev_alnum && next_alnum {
                    result.push('_');
                }
                i += 1;
            }
            c => {
                result.push(c);
                i += 1;
            }
        }
    }
    result
}

/// Parses `[label](url)` starting at `chars[0] == '['`. Returns the label
/// and the number of consumed characters.
fn parse_link(chars: &[char]) -> Option<(String, usize)> {
    let close = chars.iter().position(|&c| c == ']')?;
    if chars.get(close + 1) != Some(&'(') {
        return None;
    }
    let paren_close = chars[close + 2..].iter().position(|&c| c == ')')?;
    let label: String = chars[1..close].iter().collect();
    Some((label, close + 2 + paren_close + 1))
}
