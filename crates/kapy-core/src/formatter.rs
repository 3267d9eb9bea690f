//! Output cleaning and message splitting for chat delivery.

use std::sync::OnceLock;

use regex::Regex;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1B(?:[@-Z\x5c-_]|\[[0-?]*[ -/]*[@-~])").unwrap())
}

fn blank_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap())
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)/\.\.\.\]").unwrap())
}

/// Clean and split CLI output for messaging platforms.
pub struct OutputFormatter {
    max_length: usize,
}

impl OutputFormatter {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Strip ANSI escapes, normalize CR/CRLF to LF, collapse 3+ blank
    /// lines to 2, and trim.
    pub fn clean(&self, text: &str) -> String {
        let text = ansi_re().replace_all(text, "");
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        let text = blank_lines_re().replace_all(&text, "\n\n");
        text.trim().to_string()
    }

    /// Split long text into chunks, preferring newline boundaries in the
    /// last 20% of the budget, then spaces, then a hard cut. Appends
    /// `[i/N]` continuation markers when more than one chunk results.
    pub fn split_message(&self, text: &str) -> Vec<String> {
        if char_len(text) <= self.max_length {
            return vec![text.to_string()];
        }

        let mut chunks: Vec<String> = Vec::new();
        let mut remaining = text;
        let mut part_num = 1usize;

        loop {
            if char_len(remaining) <= self.max_length {
                chunks.push(remaining.to_string());
                break;
            }

            let split_at = self.find_split_point(remaining);
            let mut chunk = remaining[..split_at].trim_end().to_string();
            remaining = remaining[split_at..].trim_start();

            if !remaining.is_empty() {
                chunk.push_str(&format!("\n\n[{part_num}/...]"));
                part_num += 1;
            }
            chunks.push(chunk);
            if remaining.is_empty() {
                break;
            }
        }

        let total = chunks.len();
        if total > 1 {
            for (i, chunk) in chunks.iter_mut().enumerate() {
                *chunk = marker_re()
                    .replace(chunk, format!("[{}/{}]", i + 1, total))
                    .into_owned();
            }
        }
        chunks
    }

    /// Byte offset of the best split point before `max_length` chars.
    fn find_split_point(&self, text: &str) -> usize {
        let max_byte = byte_at_char(text, self.max_length);
        let search_byte = byte_at_char(text, self.max_length * 4 / 5);

        if let Some(pos) = text[..max_byte].rfind('\n') {
            if pos >= search_byte && pos > 0 {
                return pos + 1;
            }
        }
        if let Some(pos) = text[..max_byte].rfind(' ') {
            if pos >= search_byte && pos > 0 {
                return pos + 1;
            }
        }
        max_byte
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Byte index of the `n`-th character, or the full length when shorter.
fn byte_at_char(text: &str, n: usize) -> usize {
    text.char_indices()
        .nth(n)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(max: usize) -> OutputFormatter {
        OutputFormatter::new(max)
    }

    #[test]
    fn clean_strips_ansi_escapes() {
        let f = fmt(4096);
        let raw = "\x1b[32mgreen\x1b[0m text";
        assert_eq!(f.clean(raw), "green text");
    }

    #[test]
    fn clean_normalizes_carriage_returns() {
        let f = fmt(4096);
        assert_eq!(f.clean("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn clean_collapses_blank_runs() {
        let f = fmt(4096);
        assert_eq!(f.clean("a\n\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn exactly_max_length_is_one_chunk() {
        let f = fmt(100);
        let text = "a".repeat(100);
        assert_eq!(f.split_message(&text).len(), 1);
    }

    #[test]
    fn one_over_max_length_splits() {
        let f = fmt(100);
        let text = "a".repeat(101);
        let chunks = f.split_message(&text);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn markers_are_renumbered_with_total() {
        let f = fmt(50);
        let text = "word ".repeat(60);
        let chunks = f.split_message(&text);
        let total = chunks.len();
        assert!(total > 1);
        assert!(chunks[0].contains(&format!("[1/{total}]")));
        if total > 2 {
            assert!(chunks[1].contains(&format!("[2/{total}]")));
        }
        // Only intermediate chunks carry continuation markers.
        assert!(!chunks[total - 1].contains("/..."));
    }

    #[test]
    fn split_prefers_newlines_near_the_end() {
        let f = fmt(100);
        let text = format!("{}\n{}", "a".repeat(90), "b".repeat(90));
        let chunks = f.split_message(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with(&"a".repeat(90)));
        assert!(chunks[1].starts_with(&"b".repeat(90)));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let f = fmt(10);
        let text = "你好世界".repeat(10);
        let chunks = f.split_message(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            // Would have panicked on a bad boundary; also verify budget in chars.
            assert!(c.chars().count() <= 10 + 12);
        }
    }
}
