//! Human-facing output for the presentation commands: status notes and
//! aligned tables. Colour is used only when the terminal asks for it.

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";

pub fn supports_color() -> bool {
    std::env::var_os("NO_COLOR").is_none()
        && (std::env::var_os("COLORTERM").is_some()
            || std::env::var("TERM").map(|t| t != "dumb").unwrap_or(false))
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn visible_width(s: &str) -> usize {
    strip_ansi(s).chars().count()
}

pub fn note_success(msg: &str) {
    if supports_color() {
        println!("{GREEN}{BOLD}✓{RESET} {msg}");
    } else {
        println!("OK: {msg}");
    }
}

pub fn note_warn(msg: &str) {
    if supports_color() {
        println!("{YELLOW}{BOLD}⚠{RESET} {msg}");
    } else {
        println!("WARN: {msg}");
    }
}

pub fn note_error(msg: &str) {
    if supports_color() {
        eprintln!("{RED}{BOLD}✗{RESET} {msg}");
    } else {
        eprintln!("ERROR: {msg}");
    }
}

pub enum Align {
    Left,
    Right,
}

pub struct Column {
    pub header: String,
    pub align: Align,
}

impl Column {
    pub fn left(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            align: Align::Left,
        }
    }

    pub fn right(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            align: Align::Right,
        }
    }
}

/// Render rows under the given headers. Missing cells are blank; extra
/// cells are ignored.
pub fn render_table(columns: &[Column], rows: &[Vec<String>], color: bool) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| visible_width(&c.header)).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(visible_width(cell));
        }
    }

    let render_row = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .zip(columns.iter().zip(&widths))
            .map(|(cell, (column, width))| {
                let pad = " ".repeat(width.saturating_sub(visible_width(cell)));
                match column.align {
                    Align::Left => format!("{cell}{pad}"),
                    Align::Right => format!("{pad}{cell}"),
                }
            })
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    let header = render_row(columns.iter().map(|c| c.header.as_str()).collect());
    if color {
        out.push_str(&format!("{BOLD}{header}{RESET}\n"));
    } else {
        out.push_str(&header);
        out.push('\n');
    }
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&rule.join("  "));
    out.push('\n');
    for row in rows {
        let cells = (0..columns.len())
            .map(|i| row.get(i).map(String::as_str).unwrap_or(""))
            .collect();
        out.push_str(&render_row(cells));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_escape_sequences() {
        assert_eq!(strip_ansi(&format!("{GREEN}ready{RESET}")), "ready");
    }

    #[test]
    fn aligns_columns() {
        let columns = [Column::left("queue"), Column::right("ready")];
        let rows = vec![
            vec!["image-inference-queue".to_string(), "3".to_string()],
            vec!["result-queue".to_string(), "12".to_string()],
        ];
        let table = render_table(&columns, &rows, false);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], format!("{:<21}  {:>5}", "queue", "ready"));
        assert_eq!(lines[2], format!("{:<21}  {:>5}", "image-inference-queue", "3"));
        assert_eq!(lines[3], format!("{:<21}  {:>5}", "result-queue", "12"));
    }

    #[test]
    fn short_rows_are_padded() {
        let columns = [Column::left("a"), Column::left("b")];
        let table = render_table(&columns, &[vec!["x".to_string()]], false);
        assert_eq!(table.lines().last(), Some("x"));
    }
}
