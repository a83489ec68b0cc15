//! Bounded, line-windowed transcript of session output.
//!
//! This is the display-side model the browser client keeps: every received
//! chunk is joined to the current content with a line break, and only the most
//! recent `capacity` lines survive. The bundled `client.js` implements the
//! same windowing for the page.

use std::collections::VecDeque;

/// Number of lines the browser client keeps on screen.
pub const DEFAULT_CAPACITY: usize = 25;

#[derive(Debug, Clone)]
pub struct Scrollback {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Scrollback {
    /// Create an empty buffer. A capacity of zero is raised to one so that
    /// the most recent line is always retained.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a chunk of output, evicting the oldest lines beyond capacity.
    ///
    /// The chunk is split on `\n`; its first piece starts a new line rather
    /// than continuing the previous one, and a trailing `\n` leaves an empty
    /// final line.
    pub fn append(&mut self, raw: &str) {
        for line in raw.split('\n') {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_string());
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Last `n` lines of every chunk joined by line breaks.
    fn expected_window(history: &[&str], n: usize) -> Vec<String> {
        let joined = history.join("\n");
        let all: Vec<&str> = joined.split('\n').collect();
        let start = all.len().saturating_sub(n);
        all[start..].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn new_buffer_renders_empty() {
        let sb = Scrollback::default();
        assert!(sb.is_empty());
        assert_eq!(sb.render(), "");
        assert_eq!(sb.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn first_append_does_not_add_a_leading_blank_line() {
        let mut sb = Scrollback::default();
        sb.append("Welcome!");
        assert_eq!(sb.render(), "Welcome!");
        assert_eq!(sb.len(), 1);
    }

    #[test]
    fn chunks_are_joined_with_a_line_break() {
        let mut sb = Scrollback::default();
        sb.append("A room.");
        sb.append("Exits: north");
        assert_eq!(sb.render(), "A room.\nExits: north");
    }

    #[test]
    fn trailing_newline_leaves_empty_last_line() {
        let mut sb = Scrollback::default();
        sb.append("Hello\nWorld\n");
        assert_eq!(sb.lines().collect::<Vec<_>>(), vec!["Hello", "World", ""]);
        sb.append("> ");
        assert_eq!(sb.render(), "Hello\nWorld\n\n> ");
    }

    #[test]
    fn overflow_keeps_most_recent_lines() {
        let mut sb = Scrollback::new(3);
        sb.append("1\n2\n3\n4\n5");
        assert_eq!(sb.render(), "3\n4\n5");
        sb.append("6");
        assert_eq!(sb.render(), "4\n5\n6");
    }

    #[test]
    fn never_exceeds_capacity_and_matches_history_tail() {
        let chunks = [
            "You are standing in a field.\nExits: north, south\n",
            "> ",
            "A goblin arrives.",
            "\n\n\n",
            "line a\nline b\nline c\nline d\nline e\nline f\nline g\nline h",
            "",
            "x\ny\nz\n",
            "The goblin hits you.\nThe goblin hits you.\nThe goblin misses you.",
            "1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n11\n12\n13\n14\n15\n16\n17\n18\n19\n20\n21",
            "done",
        ];
        let mut sb = Scrollback::default();
        for i in 0..chunks.len() {
            sb.append(chunks[i]);
            let rendered = sb.render();
            let lines: Vec<String> = rendered.split('\n').map(str::to_string).collect();
            assert!(lines.len() <= DEFAULT_CAPACITY);
            assert_eq!(lines, expected_window(&chunks[..=i], DEFAULT_CAPACITY));
        }
    }

    #[test]
    fn single_huge_chunk_is_truncated_from_the_front() {
        let text: Vec<String> = (0..100).map(|i| format!("line {i}")).collect();
        let mut sb = Scrollback::default();
        sb.append(&text.join("\n"));
        assert_eq!(sb.len(), DEFAULT_CAPACITY);
        assert_eq!(sb.lines().next(), Some("line 75"));
        assert_eq!(sb.lines().last(), Some("line 99"));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut sb = Scrollback::new(0);
        sb.append("a\nb");
        assert_eq!(sb.capacity(), 1);
        assert_eq!(sb.render(), "b");
    }
}
