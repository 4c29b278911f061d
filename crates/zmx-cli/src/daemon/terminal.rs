//! The in-memory terminal model.
//!
//! The daemon feeds every byte the PTY produces into one of two VT
//! backends behind the [`Terminal`] trait: `vt100` (the full emulator,
//! with plain/vt/html serialization) or `avt` (a lighter state machine,
//! plain/vt only). Serialized vt output is self-contained: written to a
//! freshly reset terminal it reproduces the screen, attributes, tracked
//! modes, and cursor.

use std::fmt::Write as _;

use zmx_core::frame::SerializeFormat;

use crate::daemon::pty::TermSize;

/// Scrollback budget in cells when the daemon does not override it.
pub const DEFAULT_SCROLLBACK_CELLS: usize = 10_000_000;

/// Narrow surface the daemon needs from a VT implementation.
pub trait Terminal {
    /// Reflow to a new size; may move the cursor.
    fn resize(&mut self, size: TermSize);

    /// Append PTY output to the state machine.
    fn feed(&mut self, bytes: &[u8]);

    /// Render the current state. `None` when there is nothing to show
    /// (empty screen), or when the backend does not support the format.
    fn serialize(&self, format: SerializeFormat) -> Option<Vec<u8>>;

    /// Snapshot for re-attach: the vt form with cursor included.
    fn serialize_state(&self) -> Option<Vec<u8>> {
        self.serialize(SerializeFormat::Vt)
    }
}

/// Backend selection, resolved once at daemon startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// vt100: full emulation, html supported.
    #[default]
    Full,
    /// avt: lighter state machine, html unsupported.
    Light,
}

impl Backend {
    /// `ZMX_VT_BACKEND=light` opts into the light backend.
    pub fn from_env() -> Self {
        match std::env::var("ZMX_VT_BACKEND").as_deref() {
            Ok("light") => Backend::Light,
            _ => Backend::Full,
        }
    }
}

/// Construct the selected backend. The scrollback budget is cells;
/// backends keep whole rows, so it is divided by the width here.
pub fn new_terminal(backend: Backend, size: TermSize, scrollback_cells: usize) -> Box<dyn Terminal> {
    let rows_budget = scrollback_cells / size.cols.max(1) as usize;
    match backend {
        Backend::Full => Box::new(Vt100Backend::new(size, rows_budget)),
        Backend::Light => Box::new(AvtBackend::new(size, rows_budget)),
    }
}

/// Leading bytes of every vt snapshot: wipe and home a reset terminal.
const SNAPSHOT_PREAMBLE: &str = "\x1b[2J\x1b[H";

// ---------------------------------------------------------------------------
// vt100 backend

pub struct Vt100Backend {
    parser: vt100::Parser,
}

impl Vt100Backend {
    pub fn new(size: TermSize, scrollback_rows: usize) -> Self {
        Self {
            parser: vt100::Parser::new(size.rows, size.cols, scrollback_rows),
        }
    }

    fn render_vt(&self) -> Vec<u8> {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let mut out = String::new();
        if screen.alternate_screen() {
            out.push_str("\x1b[?1049h");
        }
        out.push_str(SNAPSHOT_PREAMBLE);

        for row in 0..rows {
            let last = last_drawn_col(screen, row, cols);
            let Some(last) = last else { continue };
            let _ = write!(out, "\x1b[{};1H", row + 1);
            let mut sgr = String::new();
            for col in 0..=last {
                if let Some(cell) = screen.cell(row, col) {
                    let wanted = cell_sgr(cell);
                    if wanted != sgr {
                        out.push_str(&wanted);
                        sgr = wanted;
                    }
                    let contents = cell.contents();
                    if contents.is_empty() && !cell.is_wide_continuation() {
                        out.push(' ');
                    } else {
                        out.push_str(&contents);
                    }
                }
            }
            out.push_str("\x1b[0m");
        }

        // Modes the emulator tracks, so full-screen programs survive
        // re-attach.
        if screen.bracketed_paste() {
            out.push_str("\x1b[?2004h");
        }
        if screen.application_cursor() {
            out.push_str("\x1b[?1h");
        }
        if screen.application_keypad() {
            out.push_str("\x1b=");
        }
        match screen.mouse_protocol_mode() {
            vt100::MouseProtocolMode::None => {}
            vt100::MouseProtocolMode::Press => out.push_str("\x1b[?9h"),
            vt100::MouseProtocolMode::PressRelease => out.push_str("\x1b[?1000h"),
            vt100::MouseProtocolMode::ButtonMotion => out.push_str("\x1b[?1002h"),
            vt100::MouseProtocolMode::AnyMotion => out.push_str("\x1b[?1003h"),
        }
        match screen.mouse_protocol_encoding() {
            vt100::MouseProtocolEncoding::Default => {}
            vt100::MouseProtocolEncoding::Utf8 => out.push_str("\x1b[?1005h"),
            vt100::MouseProtocolEncoding::Sgr => out.push_str("\x1b[?1006h"),
        }

        let (crow, ccol) = screen.cursor_position();
        let _ = write!(out, "\x1b[{};{}H", crow + 1, ccol + 1);
        if screen.hide_cursor() {
            out.push_str("\x1b[?25l");
        }
        out.into_bytes()
    }

    fn render_html(&self) -> Vec<u8> {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let mut html = String::from(
            "<pre style=\"background-color:#1e1e1e;color:#d4d4d4;\
             font-family:monospace;padding:12px;margin:0;white-space:pre;\">",
        );
        for row in 0..rows {
            let last = last_drawn_col(screen, row, cols).map(|c| c + 1).unwrap_or(0);
            let mut style = String::new();
            let mut open = false;
            for col in 0..last {
                let Some(cell) = screen.cell(row, col) else {
                    continue;
                };
                let wanted = cell_css(cell);
                if wanted != style {
                    if open {
                        html.push_str("</span>");
                        open = false;
                    }
                    if !wanted.is_empty() {
                        let _ = write!(html, "<span style=\"{}\">", wanted);
                        open = true;
                    }
                    style = wanted;
                }
                let contents = cell.contents();
                if contents.is_empty() {
                    if !cell.is_wide_continuation() {
                        html.push(' ');
                    }
                    continue;
                }
                for ch in contents.chars() {
                    match ch {
                        '<' => html.push_str("&lt;"),
                        '>' => html.push_str("&gt;"),
                        '&' => html.push_str("&amp;"),
                        '"' => html.push_str("&quot;"),
                        _ => html.push(ch),
                    }
                }
            }
            if open {
                html.push_str("</span>");
            }
            html.push('\n');
        }
        html.push_str("</pre>");
        html.into_bytes()
    }
}

impl Terminal for Vt100Backend {
    fn resize(&mut self, size: TermSize) {
        self.parser.set_size(size.rows, size.cols);
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    fn serialize(&self, format: SerializeFormat) -> Option<Vec<u8>> {
        if self.parser.screen().contents().trim().is_empty() {
            return None;
        }
        match format {
            SerializeFormat::Plain => {
                Some(self.parser.screen().contents().trim_end().as_bytes().to_vec())
            }
            SerializeFormat::Vt => Some(self.render_vt()),
            SerializeFormat::Html => Some(self.render_html()),
        }
    }
}

/// Rightmost column of a row that still carries visible content or
/// styling; `None` for an entirely blank row.
fn last_drawn_col(screen: &vt100::Screen, row: u16, cols: u16) -> Option<u16> {
    (0..cols).rev().find(|&col| {
        screen.cell(row, col).is_some_and(|cell| {
            let blank_char = cell.contents().trim().is_empty();
            let styled = cell.bgcolor() != vt100::Color::Default || cell.inverse();
            !blank_char || styled
        })
    })
}

/// Full SGR reset-and-set for a cell's attributes.
fn cell_sgr(cell: &vt100::Cell) -> String {
    let mut sgr = String::from("\x1b[0");
    if cell.bold() {
        sgr.push_str(";1");
    }
    if cell.italic() {
        sgr.push_str(";3");
    }
    if cell.underline() {
        sgr.push_str(";4");
    }
    if cell.inverse() {
        sgr.push_str(";7");
    }
    sgr_color(&mut sgr, cell.fgcolor(), 30);
    sgr_color(&mut sgr, cell.bgcolor(), 40);
    sgr.push('m');
    sgr
}

fn sgr_color(sgr: &mut String, color: vt100::Color, base: u8) {
    match color {
        vt100::Color::Default => {}
        vt100::Color::Idx(idx) if idx < 8 => {
            let _ = write!(sgr, ";{}", base + idx);
        }
        vt100::Color::Idx(idx) if idx < 16 => {
            let _ = write!(sgr, ";{}", base + 52 + idx);
        }
        vt100::Color::Idx(idx) => {
            let _ = write!(sgr, ";{};5;{}", base + 8, idx);
        }
        vt100::Color::Rgb(r, g, b) => {
            let _ = write!(sgr, ";{};2;{};{};{}", base + 8, r, g, b);
        }
    }
}

/// Inline CSS for a cell; empty when it renders with the defaults.
fn cell_css(cell: &vt100::Cell) -> String {
    let mut css = String::new();
    if let Some(hex) = color_hex(cell.fgcolor()) {
        let _ = write!(css, "color:{};", hex);
    }
    if let Some(hex) = color_hex(cell.bgcolor()) {
        let _ = write!(css, "background-color:{};", hex);
    }
    if cell.bold() {
        css.push_str("font-weight:bold;");
    }
    if cell.italic() {
        css.push_str("font-style:italic;");
    }
    if cell.underline() {
        css.push_str("text-decoration:underline;");
    }
    css
}

fn color_hex(color: vt100::Color) -> Option<String> {
    const PALETTE: [&str; 16] = [
        "#000000", "#cd3131", "#0dbc79", "#e5e510", "#2472c8", "#bc3fbc", "#11a8cd", "#e5e5e5",
        "#505050", "#f14c4c", "#23d18b", "#f5f543", "#3b8eea", "#d670d6", "#29b8db", "#ffffff",
    ];
    match color {
        vt100::Color::Default => None,
        vt100::Color::Idx(idx) if (idx as usize) < PALETTE.len() => {
            Some(PALETTE[idx as usize].to_string())
        }
        vt100::Color::Idx(_) => None,
        vt100::Color::Rgb(r, g, b) => Some(format!("#{:02x}{:02x}{:02x}", r, g, b)),
    }
}

// ---------------------------------------------------------------------------
// avt backend

pub struct AvtBackend {
    vt: avt::Vt,
    /// Trailing bytes of an incomplete UTF-8 sequence, carried to the
    /// next feed (avt consumes `&str`).
    carry: Vec<u8>,
}

impl AvtBackend {
    pub fn new(size: TermSize, scrollback_rows: usize) -> Self {
        let vt = avt::Vt::builder()
            .size(size.cols as usize, size.rows as usize)
            .scrollback_limit(scrollback_rows)
            .build();
        Self {
            vt,
            carry: Vec::new(),
        }
    }

    fn screen_is_empty(&self) -> bool {
        self.vt
            .view()
            .iter()
            .all(|line| line.cells().iter().all(|c| c.char() == ' '))
    }

    fn render_vt(&self) -> Vec<u8> {
        let mut out = String::from(SNAPSHOT_PREAMBLE);
        for (row, line) in self.vt.view().iter().enumerate() {
            let text = line_text(line);
            if text.is_empty() {
                continue;
            }
            let _ = write!(out, "\x1b[{};1H", row + 1);
            dump_line(&mut out, line);
            out.push_str("\x1b[0m");
        }
        let cursor = self.vt.cursor();
        let _ = write!(out, "\x1b[{};{}H", cursor.row + 1, cursor.col + 1);
        if !cursor.visible {
            out.push_str("\x1b[?25l");
        }
        out.into_bytes()
    }

    fn render_plain(&self) -> Vec<u8> {
        // `lines()` walks scrollback plus the live view, so history in
        // the light backend reaches past the screen.
        let mut lines: Vec<String> = self.vt.lines().iter().map(|line| line_text(line)).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n").into_bytes()
    }
}

impl Terminal for AvtBackend {
    fn resize(&mut self, size: TermSize) {
        self.vt.resize(size.cols as usize, size.rows as usize);
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.carry.extend_from_slice(bytes);
        let mut data = std::mem::take(&mut self.carry);
        loop {
            match std::str::from_utf8(&data) {
                Ok(text) => {
                    self.vt.feed_str(text);
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    if valid > 0 {
                        self.vt.feed_str(std::str::from_utf8(&data[..valid]).unwrap());
                    }
                    match err.error_len() {
                        // Invalid sequence: substitute and continue after it.
                        Some(bad) => {
                            self.vt.feed_str("\u{FFFD}");
                            data.drain(..valid + bad);
                        }
                        // Incomplete tail: keep it for the next feed.
                        None => {
                            data.drain(..valid);
                            self.carry = data;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn serialize(&self, format: SerializeFormat) -> Option<Vec<u8>> {
        match format {
            SerializeFormat::Html => None,
            _ if self.screen_is_empty() => None,
            SerializeFormat::Plain => Some(self.render_plain()),
            SerializeFormat::Vt => Some(self.render_vt()),
        }
    }
}

fn line_text(line: &avt::Line) -> String {
    line.cells()
        .iter()
        .map(|c| c.char())
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Append a line's cells with SGR runs: one pen write per attribute
/// change.
fn dump_line(out: &mut String, line: &avt::Line) {
    for cells in line.chunks(|a, b| a.pen() != b.pen()) {
        dump_pen(out, cells[0].pen());
        for cell in &cells {
            out.push(cell.char());
        }
    }
}

fn dump_pen(out: &mut String, pen: &avt::Pen) {
    out.push_str("\x1b[0");
    if let Some(c) = pen.foreground() {
        out.push(';');
        dump_color(out, c, 30);
    }
    if let Some(c) = pen.background() {
        out.push(';');
        dump_color(out, c, 40);
    }
    if pen.is_bold() {
        out.push_str(";1");
    }
    if pen.is_faint() {
        out.push_str(";2");
    }
    if pen.is_italic() {
        out.push_str(";3");
    }
    if pen.is_underline() {
        out.push_str(";4");
    }
    if pen.is_blink() {
        out.push_str(";5");
    }
    if pen.is_inverse() {
        out.push_str(";7");
    }
    if pen.is_strikethrough() {
        out.push_str(";9");
    }
    out.push('m');
}

fn dump_color(out: &mut String, color: avt::Color, base: u8) {
    match color {
        avt::Color::Indexed(c) if c < 8 => {
            let _ = write!(out, "{}", base + c);
        }
        avt::Color::Indexed(c) if c < 16 => {
            let _ = write!(out, "{}", base + 52 + c);
        }
        avt::Color::Indexed(c) => {
            let _ = write!(out, "{}:5:{}", base + 8, c);
        }
        avt::Color::RGB(rgb) => {
            let _ = write!(out, "{}:2:{}:{}:{}", base + 8, rgb.r, rgb.g, rgb.b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: TermSize = TermSize { cols: 80, rows: 24 };

    fn backends() -> Vec<(&'static str, Box<dyn Terminal>)> {
        vec![
            ("full", new_terminal(Backend::Full, SIZE, DEFAULT_SCROLLBACK_CELLS)),
            ("light", new_terminal(Backend::Light, SIZE, DEFAULT_SCROLLBACK_CELLS)),
        ]
    }

    #[test]
    fn empty_screen_serializes_to_none() {
        for (which, term) in backends() {
            for format in [SerializeFormat::Plain, SerializeFormat::Vt] {
                assert!(
                    term.serialize(format).is_none(),
                    "{which} backend produced output for an empty screen"
                );
            }
        }
    }

    #[test]
    fn plain_contains_fed_text() {
        for (which, mut term) in backends() {
            term.feed(b"hello world\r\nsecond line");
            let plain = term.serialize(SerializeFormat::Plain).unwrap();
            let text = String::from_utf8(plain).unwrap();
            assert!(text.contains("hello world"), "{which}: {text:?}");
            assert!(text.contains("second line"), "{which}: {text:?}");
        }
    }

    #[test]
    fn vt_snapshot_is_framed_by_clear_and_cursor() {
        for (which, mut term) in backends() {
            term.feed(b"prompt$ echo hi\r\nhi");
            let vt = term.serialize(SerializeFormat::Vt).unwrap();
            assert!(
                vt.starts_with(SNAPSHOT_PREAMBLE.as_bytes()),
                "{which} snapshot must begin with clear+home"
            );
            // The cursor lands on row 2 after "hi", so the snapshot ends
            // with a cursor-position sequence (optionally a visibility
            // toggle after it).
            let text = String::from_utf8(vt).unwrap();
            let tail = text.rsplit('\x1b').next().unwrap();
            assert!(
                tail.starts_with('[') && tail.ends_with('H'),
                "{which} snapshot tail {tail:?} is not a cursor position"
            );
        }
    }

    #[test]
    fn snapshot_reflects_cursor_row() {
        for (which, mut term) in backends() {
            term.feed(b"a\r\nb\r\nc");
            let vt = String::from_utf8(term.serialize_state().unwrap()).unwrap();
            assert!(
                vt.ends_with("\x1b[3;2H"),
                "{which}: cursor should be row 3 col 2, snapshot ends {:?}",
                &vt[vt.len().saturating_sub(12)..]
            );
        }
    }

    #[test]
    fn hidden_cursor_is_preserved() {
        for (which, mut term) in backends() {
            term.feed(b"x\x1b[?25l");
            let vt = String::from_utf8(term.serialize_state().unwrap()).unwrap();
            assert!(vt.ends_with("\x1b[?25l"), "{which}: {vt:?}");
        }
    }

    #[test]
    fn resize_reflows_both_backends() {
        for (_which, mut term) in backends() {
            term.feed(b"stays");
            term.resize(TermSize { cols: 40, rows: 10 });
            let plain = term.serialize(SerializeFormat::Plain).unwrap();
            assert!(String::from_utf8(plain).unwrap().contains("stays"));
        }
    }

    #[test]
    fn colors_survive_vt_round_trip() {
        let mut term = Vt100Backend::new(SIZE, 0);
        term.feed(b"\x1b[31mred\x1b[0m plain");
        let vt = String::from_utf8(term.serialize(SerializeFormat::Vt).unwrap()).unwrap();
        assert!(vt.contains(";31m"), "foreground run missing: {vt:?}");

        // Feeding the snapshot into a fresh emulator reproduces the cell.
        let mut replay = Vt100Backend::new(SIZE, 0);
        replay.feed(vt.as_bytes());
        let cell = replay.parser.screen().cell(0, 0).unwrap();
        assert_eq!(cell.contents(), "r");
        assert_eq!(cell.fgcolor(), vt100::Color::Idx(1));
    }

    #[test]
    fn html_escapes_markup() {
        let mut term = Vt100Backend::new(SIZE, 0);
        term.feed(b"<script>&\"quotes\"");
        let html = String::from_utf8(term.serialize(SerializeFormat::Html).unwrap()).unwrap();
        assert!(html.starts_with("<pre"));
        assert!(html.ends_with("</pre>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("&amp;"));
        assert!(html.contains("&quot;quotes&quot;"));
    }

    #[test]
    fn html_styles_colored_cells() {
        let mut term = Vt100Backend::new(SIZE, 0);
        term.feed(b"\x1b[34mblue\x1b[0m");
        let html = String::from_utf8(term.serialize(SerializeFormat::Html).unwrap()).unwrap();
        assert!(html.contains("color:#2472c8"), "{html}");
        assert!(html.contains("blue"));
    }

    #[test]
    fn light_backend_declines_html() {
        let mut term = AvtBackend::new(SIZE, 0);
        term.feed(b"content");
        assert!(term.serialize(SerializeFormat::Html).is_none());
    }

    #[test]
    fn light_backend_history_reaches_past_screen() {
        let small = TermSize { cols: 20, rows: 4 };
        let mut term = AvtBackend::new(small, 100);
        for i in 0..10 {
            term.feed(format!("line-{i}\r\n").as_bytes());
        }
        let plain = String::from_utf8(term.serialize(SerializeFormat::Plain).unwrap()).unwrap();
        assert!(plain.contains("line-0"), "scrollback missing: {plain}");
        assert!(plain.contains("line-9"));
    }

    #[test]
    fn split_utf8_across_feeds() {
        let mut term = AvtBackend::new(SIZE, 0);
        let text = "héllo".as_bytes();
        term.feed(&text[..2]); // cuts the é in half
        term.feed(&text[2..]);
        let plain = String::from_utf8(term.serialize(SerializeFormat::Plain).unwrap()).unwrap();
        assert!(plain.contains("héllo"), "{plain:?}");
    }

    #[test]
    fn invalid_utf8_is_substituted_not_dropped() {
        let mut term = AvtBackend::new(SIZE, 0);
        term.feed(b"a\xFFb");
        let plain = String::from_utf8(term.serialize(SerializeFormat::Plain).unwrap()).unwrap();
        assert!(plain.starts_with('a') && plain.contains('b'), "{plain:?}");
    }

    #[test]
    fn backend_selection_from_env() {
        // Not env-guarded: ZMX_VT_BACKEND is read nowhere else in tests.
        std::env::remove_var("ZMX_VT_BACKEND");
        assert_eq!(Backend::from_env(), Backend::Full);
        std::env::set_var("ZMX_VT_BACKEND", "light");
        assert_eq!(Backend::from_env(), Backend::Light);
        std::env::remove_var("ZMX_VT_BACKEND");
    }
}
