//! Backend output formatting.
//!
//! Backend chunks arrive as raw bytes that may carry ANSI SGR color codes.
//! A [`Formatter`] turns one chunk into markup for the browser. Every chunk is
//! formatted independently: open styles never leak into the next chunk, so
//! the output is a pure function of the input bytes. Every path out of this
//! module, including the fallback for a failed format, is HTML-escaped.
//!
//! TCP reads can end in the middle of a UTF-8 character or an escape
//! sequence. [`ChunkCarry`] holds such a tail back so it is formatted with
//! the bytes that complete it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("malformed escape sequence at offset {0}")]
    MalformedEscape(usize),
}

pub trait Formatter: Send + Sync {
    fn format(&self, raw: &[u8]) -> Result<String, FormatError>;
}

/// Which formatter the relay applies to backend output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatMode {
    #[default]
    Html,
    Plain,
}

impl FormatMode {
    pub fn formatter(self) -> Arc<dyn Formatter> {
        match self {
            FormatMode::Html => Arc::new(AnsiHtml),
            FormatMode::Plain => Arc::new(PlainText),
        }
    }
}

/// Format a chunk, falling back to escaped, undecorated text if the formatter
/// rejects it. Output is never dropped.
pub fn format_or_raw(formatter: &dyn Formatter, raw: &[u8]) -> String {
    match formatter.format(raw) {
        Ok(markup) => markup,
        Err(e) => {
            tracing::warn!(error = %e, len = raw.len(), "formatter failed, delivering raw output");
            escape_text(raw)
        }
    }
}

/// Lossy-decode `raw` and HTML-escape it. Escape introducers are removed so
/// they do not reach the page as stray control characters.
fn escape_text(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    for ch in text.chars().filter(|&c| c != '\x1b') {
        push_escaped(&mut out, ch);
    }
    out
}

fn push_escaped(out: &mut String, ch: char) {
    match ch {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        '\'' => out.push_str("&#x27;"),
        c => out.push(c),
    }
}

/// Escaped text with escape sequences stripped and no color.
pub struct PlainText;

impl Formatter for PlainText {
    fn format(&self, raw: &[u8]) -> Result<String, FormatError> {
        render(raw, false)
    }
}

/// ANSI SGR to HTML conversion.
///
/// Text is HTML-escaped. SGR sequences become `<span style="...">` runs;
/// other CSI sequences (cursor movement, erase) and OSC strings are dropped.
/// Invalid UTF-8 is replaced with U+FFFD, and a sequence cut off by the end
/// of the chunk is dropped. A control character inside a sequence is an
/// error.
pub struct AnsiHtml;

impl Formatter for AnsiHtml {
    fn format(&self, raw: &[u8]) -> Result<String, FormatError> {
        render(raw, true)
    }
}

fn render(raw: &[u8], styled: bool) -> Result<String, FormatError> {
    let text = String::from_utf8_lossy(raw);
    let mut writer = HtmlWriter::new(text.len(), styled);
    let mut chars = text.char_indices();

    while let Some((pos, ch)) = chars.next() {
        if ch != '\x1b' {
            writer.push_text(ch);
            continue;
        }
        match chars.next() {
            None => break,
            Some((_, '[')) => {
                let mut params = String::new();
                let final_byte = loop {
                    match chars.next() {
                        None => break None,
                        Some((_, c @ '\x40'..='\x7e')) => break Some(c),
                        Some((_, c @ '\x20'..='\x3f')) => params.push(c),
                        Some(_) => return Err(FormatError::MalformedEscape(pos)),
                    }
                };
                if final_byte == Some('m') {
                    writer.style.apply_sgr(&params);
                }
            }
            Some((_, ']')) => loop {
                // OSC runs until BEL or ST (ESC \)
                match chars.next() {
                    None | Some((_, '\x07')) => break,
                    Some((_, '\x1b')) => match chars.next() {
                        None | Some((_, '\\')) => break,
                        Some(_) => return Err(FormatError::MalformedEscape(pos)),
                    },
                    Some(_) => {}
                }
            },
            // Two-byte escapes (charset selection, keypad modes) carry no text.
            Some(_) => {}
        }
    }

    Ok(writer.finish())
}

/// Longest trailing escape sequence worth holding for the next chunk.
const MAX_HELD_ESCAPE: usize = 64;

/// Per-session reassembly of chunk boundaries.
#[derive(Debug, Default)]
pub struct ChunkCarry {
    held: Vec<u8>,
}

impl ChunkCarry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend any held bytes to `chunk` and return the part that is complete.
    /// An incomplete trailing UTF-8 character or escape sequence is kept back.
    pub fn complete(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.held);
        buf.extend_from_slice(chunk);
        let cut = buf.len() - incomplete_tail(&buf);
        self.held = buf.split_off(cut);
        buf
    }

    /// Release whatever is still held, once no more output will follow.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.held)
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Length of the incomplete tail of `buf`, or 0.
fn incomplete_tail(buf: &[u8]) -> usize {
    let window = buf.len().saturating_sub(MAX_HELD_ESCAPE);
    if let Some(offset) = buf[window..].iter().rposition(|&b| b == 0x1b) {
        let start = window + offset;
        if escape_is_incomplete(&buf[start..]) {
            return buf.len() - start;
        }
    }
    incomplete_utf8(buf)
}

fn escape_is_incomplete(seq: &[u8]) -> bool {
    match seq.get(1) {
        None => true,
        Some(b'[') => seq[2..].iter().all(|b| (0x20..=0x3f).contains(b)),
        Some(b']') => !seq[2..].contains(&0x07),
        Some(_) => false,
    }
}

fn incomplete_utf8(buf: &[u8]) -> usize {
    for back in 1..=buf.len().min(3) {
        let b = buf[buf.len() - back];
        if b & 0xc0 == 0x80 {
            continue;
        }
        let width = match b {
            0xc2..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf4 => 4,
            _ => return 0,
        };
        return if width > back { back } else { 0 };
    }
    0
}

struct HtmlWriter {
    out: String,
    style: Style,
    open: Option<Style>,
    styled: bool,
}

impl HtmlWriter {
    fn new(len: usize, styled: bool) -> Self {
        Self {
            out: String::with_capacity(len),
            style: Style::default(),
            open: None,
            styled,
        }
    }

    fn push_text(&mut self, ch: char) {
        let wanted = (self.styled && !self.style.is_default()).then(|| self.style.clone());
        if self.open != wanted {
            if self.open.is_some() {
                self.out.push_str("</span>");
            }
            if let Some(style) = &wanted {
                self.out.push_str("<span style=\"");
                self.out.push_str(&style.css());
                self.out.push_str("\">");
            }
            self.open = wanted;
        }
        push_escaped(&mut self.out, ch);
    }

    fn finish(mut self) -> String {
        if self.open.is_some() {
            self.out.push_str("</span>");
        }
        self.out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Style {
    fg: Option<Color>,
    bg: Option<Color>,
    bold: bool,
    faint: bool,
    italic: bool,
    underline: bool,
    strikethrough: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Color {
    Indexed(u8),
    Rgb { r: u8, g: u8, b: u8 },
}

impl Style {
    fn is_default(&self) -> bool {
        *self == Style::default()
    }

    /// Apply the semicolon-separated parameter list of one SGR sequence.
    fn apply_sgr(&mut self, params: &str) {
        let codes: Vec<u16> = if params.is_empty() {
            vec![0]
        } else {
            params
                .split(';')
                .map(|p| if p.is_empty() { Some(0) } else { p.parse().ok() })
                .collect::<Option<Vec<_>>>()
                .unwrap_or_default()
        };

        let mut codes = codes.into_iter();
        while let Some(code) = codes.next() {
            match code {
                0 => *self = Style::default(),
                1 => self.bold = true,
                2 => self.faint = true,
                3 => self.italic = true,
                4 => self.underline = true,
                9 => self.strikethrough = true,
                22 => {
                    self.bold = false;
                    self.faint = false;
                }
                23 => self.italic = false,
                24 => self.underline = false,
                29 => self.strikethrough = false,
                30..=37 => self.fg = Some(Color::Indexed((code - 30) as u8)),
                39 => self.fg = None,
                40..=47 => self.bg = Some(Color::Indexed((code - 40) as u8)),
                49 => self.bg = None,
                90..=97 => self.fg = Some(Color::Indexed((code - 90 + 8) as u8)),
                100..=107 => self.bg = Some(Color::Indexed((code - 100 + 8) as u8)),
                38 | 48 => {
                    let Some(color) = extended_color(&mut codes) else {
                        return;
                    };
                    if code == 38 {
                        self.fg = Some(color);
                    } else {
                        self.bg = Some(color);
                    }
                }
                _ => {}
            }
        }
    }

    fn css(&self) -> String {
        let mut decls = Vec::new();
        if let Some(fg) = &self.fg {
            decls.push(format!("color:{}", fg.css()));
        }
        if let Some(bg) = &self.bg {
            decls.push(format!("background-color:{}", bg.css()));
        }
        if self.bold {
            decls.push("font-weight:bold".to_string());
        }
        if self.faint {
            decls.push("opacity:0.5".to_string());
        }
        if self.italic {
            decls.push("font-style:italic".to_string());
        }
        match (self.underline, self.strikethrough) {
            (true, true) => decls.push("text-decoration:underline line-through".to_string()),
            (true, false) => decls.push("text-decoration:underline".to_string()),
            (false, true) => decls.push("text-decoration:line-through".to_string()),
            (false, false) => {}
        }
        decls.join(";")
    }
}

/// Parse the tail of a `38`/`48` sequence: `5;n` or `2;r;g;b`.
fn extended_color(codes: &mut impl Iterator<Item = u16>) -> Option<Color> {
    let byte = |v: u16| u8::try_from(v).ok();
    match codes.next()? {
        5 => Some(Color::Indexed(byte(codes.next()?)?)),
        2 => {
            let r = byte(codes.next()?)?;
            let g = byte(codes.next()?)?;
            let b = byte(codes.next()?)?;
            Some(Color::Rgb { r, g, b })
        }
        _ => None,
    }
}

/// The xterm/VGA base palette for indices 0-15.
const BASE_PALETTE: [&str; 16] = [
    "#000", "#A00", "#0A0", "#A50", "#00A", "#A0A", "#0AA", "#AAA", "#555", "#F55", "#5F5",
    "#FF5", "#55F", "#F5F", "#5FF", "#FFF",
];

const CUBE_LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];

impl Color {
    fn css(&self) -> String {
        match *self {
            Color::Indexed(idx @ 0..=15) => BASE_PALETTE[idx as usize].to_string(),
            Color::Indexed(idx @ 16..=231) => {
                let i = idx - 16;
                let r = CUBE_LEVELS[(i / 36) as usize];
                let g = CUBE_LEVELS[((i / 6) % 6) as usize];
                let b = CUBE_LEVELS[(i % 6) as usize];
                format!("#{:02x}{:02x}{:02x}", r, g, b)
            }
            Color::Indexed(idx) => {
                let level = 8 + 10 * (idx - 232);
                format!("#{:02x}{:02x}{:02x}", level, level, level)
            }
            Color::Rgb { r, g, b } => format!("#{:02x}{:02x}{:02x}", r, g, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(raw: &str) -> String {
        AnsiHtml.format(raw.as_bytes()).unwrap()
    }

    #[test]
    fn plain_text_is_unchanged() {
        assert_eq!(html("Hello\nWorld\n"), "Hello\nWorld\n");
    }

    #[test]
    fn markup_characters_are_escaped() {
        assert_eq!(
            html("<script>alert('x' & \"y\")</script>"),
            "&lt;script&gt;alert(&#x27;x&#x27; &amp; &quot;y&quot;)&lt;/script&gt;"
        );
    }

    #[test]
    fn basic_foreground_color() {
        assert_eq!(
            html("\x1b[31mred\x1b[0m plain"),
            "<span style=\"color:#A00\">red</span> plain"
        );
    }

    #[test]
    fn bright_colors_and_background() {
        assert_eq!(
            html("\x1b[92;44mx"),
            "<span style=\"color:#5F5;background-color:#00A\">x</span>"
        );
    }

    #[test]
    fn bold_and_underline() {
        assert_eq!(
            html("\x1b[1;4mloud\x1b[22mquiet"),
            "<span style=\"font-weight:bold;text-decoration:underline\">loud</span>\
             <span style=\"text-decoration:underline\">quiet</span>"
        );
    }

    #[test]
    fn indexed_256_colors() {
        assert_eq!(html("\x1b[38;5;196mx"), "<span style=\"color:#ff0000\">x</span>");
        assert_eq!(html("\x1b[48;5;232mx"), "<span style=\"background-color:#080808\">x</span>");
        assert_eq!(html("\x1b[38;5;9mx"), "<span style=\"color:#F55\">x</span>");
    }

    #[test]
    fn truecolor() {
        assert_eq!(
            html("\x1b[38;2;1;2;255mx"),
            "<span style=\"color:#0102ff\">x</span>"
        );
    }

    #[test]
    fn reset_with_empty_params() {
        assert_eq!(html("\x1b[33mgold\x1b[m."), "<span style=\"color:#A50\">gold</span>.");
    }

    #[test]
    fn open_style_is_closed_at_end_of_chunk() {
        assert_eq!(html("\x1b[36mcyan"), "<span style=\"color:#0AA\">cyan</span>");
        // the next chunk starts unstyled
        assert_eq!(html("after"), "after");
    }

    #[test]
    fn consecutive_sgr_without_text_emits_no_empty_span() {
        assert_eq!(html("\x1b[31m\x1b[32m\x1b[0mx"), "x");
    }

    #[test]
    fn non_sgr_csi_is_dropped() {
        assert_eq!(html("\x1b[2J\x1b[Hstart"), "start");
    }

    #[test]
    fn osc_title_is_dropped() {
        assert_eq!(html("\x1b]0;My MUD\x07hi"), "hi");
        assert_eq!(html("\x1b]0;My MUD\x1b\\hi"), "hi");
    }

    #[test]
    fn invalid_sgr_parameters_are_ignored() {
        assert_eq!(html("\x1b[70000mtext"), "text");
        assert_eq!(html("\x1b[1<mtext"), "text");
        assert_eq!(html("\x1b[38;5mtext"), "text");
    }

    #[test]
    fn escape_cut_off_at_end_of_chunk_is_dropped() {
        assert_eq!(AnsiHtml.format(b"ok\x1b[31").unwrap(), "ok");
        assert_eq!(AnsiHtml.format(b"ok\x1b").unwrap(), "ok");
        assert_eq!(AnsiHtml.format(b"<\x1b]0;title").unwrap(), "&lt;");
    }

    #[test]
    fn control_character_inside_csi_is_malformed() {
        assert_eq!(
            AnsiHtml.format(b"\x1b[3\n1m"),
            Err(FormatError::MalformedEscape(0))
        );
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(AnsiHtml.format(&[b'<', 0xff, b'>']).unwrap(), "&lt;\u{fffd}&gt;");
        assert_eq!(AnsiHtml.format(&[b'h', 0xc3]).unwrap(), "h\u{fffd}");
    }

    #[test]
    fn full_read_of_markup_ending_mid_character_stays_escaped() {
        let mut raw = vec![b'<'; 4095];
        raw.push(0xc3);
        let markup = AnsiHtml.format(&raw).unwrap();
        assert!(!markup.contains('<'));
        assert_eq!(markup.matches("&lt;").count(), 4095);
        assert!(markup.ends_with('\u{fffd}'));
    }

    #[test]
    fn formatting_is_deterministic() {
        let raw = b"\x1b[1;31mThe goblin\x1b[0m hits <you>.\n";
        assert_eq!(AnsiHtml.format(raw), AnsiHtml.format(raw));
    }

    #[test]
    fn format_or_raw_falls_back_to_escaped_text() {
        assert_eq!(
            format_or_raw(&AnsiHtml, b"<b>\x1b[3\n1m & 'x'"),
            "&lt;b&gt;[3\n1m &amp; &#x27;x&#x27;"
        );
    }

    #[test]
    fn format_or_raw_passes_markup_through() {
        assert_eq!(
            format_or_raw(&AnsiHtml, b"\x1b[32mok"),
            "<span style=\"color:#0A0\">ok</span>"
        );
    }

    #[test]
    fn plain_text_strips_escapes_and_escapes_markup() {
        assert_eq!(PlainText.format(b"\x1b[31m<red>\x1b[0m").unwrap(), "&lt;red&gt;");
        assert_eq!(PlainText.format(&[b'a', 0xff]).unwrap(), "a\u{fffd}");
    }

    #[test]
    fn format_mode_selects_formatter() {
        let html = FormatMode::Html.formatter();
        let plain = FormatMode::Plain.formatter();
        assert_eq!(html.format(b"\x1b[31m<").unwrap(), "<span style=\"color:#A00\">&lt;</span>");
        assert_eq!(plain.format(b"\x1b[31m<").unwrap(), "&lt;");
    }

    #[test]
    fn carry_holds_split_character() {
        let mut carry = ChunkCarry::new();
        let e_acute = "é".as_bytes();
        assert_eq!(carry.complete(&[b'a', e_acute[0]]), b"a");
        assert!(!carry.is_empty());
        assert_eq!(carry.complete(&[e_acute[1], b'!']), "é!".as_bytes());
        assert!(carry.is_empty());
    }

    #[test]
    fn carry_holds_split_four_byte_character() {
        let mut carry = ChunkCarry::new();
        let crab = "🦀".as_bytes();
        assert_eq!(carry.complete(&crab[..1]), b"");
        assert_eq!(carry.complete(&crab[1..3]), b"");
        assert_eq!(carry.complete(&crab[3..]), crab);
    }

    #[test]
    fn carry_holds_split_escape() {
        let mut carry = ChunkCarry::new();
        assert_eq!(carry.complete(b"hp \x1b[3"), b"hp ");
        assert_eq!(carry.complete(b"1m42\x1b[0m"), b"\x1b[31m42\x1b[0m");
        assert_eq!(carry.complete(b"\x1b"), b"");
        assert_eq!(carry.complete(b"]0;t"), b"");
        assert_eq!(carry.complete(b"itle\x07ok"), b"\x1b]0;title\x07ok");
    }

    #[test]
    fn carry_passes_complete_chunks_through() {
        let mut carry = ChunkCarry::new();
        assert_eq!(carry.complete(b"\x1b[31mred\x1b[0m\n"), b"\x1b[31mred\x1b[0m\n");
        assert_eq!(carry.complete(&[b'x', 0xff]), [b'x', 0xff]);
        assert!(carry.is_empty());
    }

    #[test]
    fn carry_flush_releases_held_bytes() {
        let mut carry = ChunkCarry::new();
        carry.complete(b"bye\x1b[");
        assert_eq!(carry.flush(), b"\x1b[");
        assert!(carry.is_empty());
    }

    #[test]
    fn carry_does_not_hold_long_unterminated_sequences() {
        let mut carry = ChunkCarry::new();
        let mut raw = b"\x1b]".to_vec();
        raw.extend(std::iter::repeat(b'x').take(MAX_HELD_ESCAPE * 2));
        assert_eq!(carry.complete(&raw), raw);
    }
}
